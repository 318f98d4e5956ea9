pub mod coupon;
pub mod coupon_redemption;
pub mod download_token;
pub mod order;
pub mod template;

pub use order::OrderStatus;
