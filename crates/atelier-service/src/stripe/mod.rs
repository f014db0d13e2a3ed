//! Stripe integration: REST client and webhook signature verification.

mod client;
mod types;

pub use client::{sign_payload, verify_signature, StripeClient, StripeError};
pub use types::{
    Customer, PaymentIntent, SetupIntent, StripeSubscription, StripeSubscriptionItem,
};
