//! Stripe API response types (the subset this service consumes).

use serde::Deserialize;

/// A Stripe customer.
#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    /// Customer id (`cus_...`).
    pub id: String,
    /// Email, if set.
    pub email: Option<String>,
    /// Name, if set.
    pub name: Option<String>,
}

/// A payment intent.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    /// Intent id (`pi_...`).
    pub id: String,
    /// Client secret for confirmation in the browser.
    pub client_secret: Option<String>,
    /// Intent status.
    pub status: String,
    /// Amount in cents.
    #[serde(default)]
    pub amount: i64,
    /// Currency.
    #[serde(default)]
    pub currency: String,
}

/// A setup intent (saving a payment method without charging).
#[derive(Debug, Clone, Deserialize)]
pub struct SetupIntent {
    /// Intent id (`seti_...`).
    pub id: String,
    /// Client secret for confirmation in the browser.
    pub client_secret: Option<String>,
    /// Intent status.
    pub status: String,
}

/// A subscription as returned by the Stripe API.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    /// Subscription id (`sub_...`).
    pub id: String,
    /// Subscription status (`active`, `incomplete`, ...).
    pub status: String,
    /// Current period start (unix seconds).
    pub current_period_start: Option<i64>,
    /// Current period end (unix seconds).
    pub current_period_end: Option<i64>,
    /// Line items.
    #[serde(default)]
    pub items: SubscriptionItemList,
}

/// The `items` list of a subscription.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItemList {
    /// Items.
    #[serde(default)]
    pub data: Vec<StripeSubscriptionItem>,
}

/// One subscription line item.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscriptionItem {
    /// Item id (`si_...`).
    pub id: String,
    /// The price backing the item.
    pub price: PriceRef,
    /// Quantity.
    #[serde(default)]
    pub quantity: Option<i64>,
}

/// A price reference inside a subscription item.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceRef {
    /// Price id (`price_...`).
    pub id: String,
}

/// Stripe error envelope.
#[derive(Debug, Deserialize)]
pub struct StripeErrorResponse {
    /// The error body.
    pub error: StripeErrorBody,
}

/// Stripe error body.
#[derive(Debug, Deserialize)]
pub struct StripeErrorBody {
    /// Error type.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Machine-readable code.
    pub code: Option<String>,
}
