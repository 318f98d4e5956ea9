// Checkout and reconciliation
pub mod fulfillment;
pub mod orders;
pub mod velocity;

// Pricing and catalog
pub mod catalog;
pub mod coupons;

// Post-payment artifacts and messaging
pub mod download_tokens;
pub mod notifications;

// External payment processors
pub mod gateway;
