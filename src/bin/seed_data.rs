//! Seed data script - populates the database with demo catalog data
//!
//! Run with: cargo run --bin seed-data
//!
//! This creates:
//! - 4 published templates and 1 draft
//! - 3 coupons (percentage, fixed, email-restricted)

use chrono::{Duration, Utc};
use sea_orm::{ConnectOptions, Database};
use std::{sync::Arc, time::Duration as StdDuration};
use tracing::info;

use storefront_api::{
    common::TimestampInput,
    entities::{coupon::DiscountType, template::TemplateStatus},
    services::{
        catalog::{CatalogService, CreateTemplateInput},
        coupons::{CouponService, CreateCouponInput},
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("=== Storefront seed data ===");

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://storefront.db?mode=rwc".to_string());
    let currency = std::env::var("APP__DEFAULT_CURRENCY").unwrap_or_else(|_| "INR".to_string());

    let mut options = ConnectOptions::new(database_url.clone());
    options
        .max_connections(5)
        .min_connections(1)
        .connect_timeout(StdDuration::from_secs(10))
        .acquire_timeout(StdDuration::from_secs(10));

    info!("Connecting to database: {}", database_url);
    let db = Database::connect(options).await?;
    storefront_api::db::run_migrations(&db).await?;
    let db = Arc::new(db);

    let catalog = CatalogService::new(db.clone(), currency);
    let coupons = CouponService::new(db);

    let templates = [
        ("CRM lead sync", "Push new form leads into your CRM", 4_900, None),
        ("Invoice parser", "Extract line items from emailed invoices", 9_900, None),
        ("Slack standup bot", "Collect daily standups in a channel", 2_900, None),
        ("Launch bundle", "Limited run of onboarding workflows", 19_900, Some(25)),
    ];
    for (title, description, price, stock) in templates {
        let template = catalog
            .create_template(CreateTemplateInput {
                title: title.to_string(),
                description: Some(description.to_string()),
                price,
                currency: None,
                status: Some(TemplateStatus::Published),
                stock,
            })
            .await?;
        info!("  template {} ({})", template.title, template.id);
    }
    catalog
        .create_template(CreateTemplateInput {
            title: "Unreleased connector".to_string(),
            description: None,
            price: 1_900,
            currency: None,
            status: Some(TemplateStatus::Draft),
            stock: None,
        })
        .await?;

    let now = Utc::now();
    let window = |days: i64| {
        (
            TimestampInput::from(now - Duration::days(1)),
            TimestampInput::from(now + Duration::days(days)),
        )
    };

    let (from, until) = window(30);
    coupons
        .create_coupon(CreateCouponInput {
            code: "WELCOME20".into(),
            discount_type: DiscountType::Percentage,
            discount_value: 20,
            valid_from: from,
            valid_until: until,
            usage_limit: None,
            specific_email: None,
            is_active: true,
        })
        .await?;

    let (from, until) = window(7);
    coupons
        .create_coupon(CreateCouponInput {
            code: "FLAT500".into(),
            discount_type: DiscountType::Fixed,
            discount_value: 500,
            valid_from: from,
            valid_until: until,
            usage_limit: Some(100),
            specific_email: None,
            is_active: true,
        })
        .await?;

    let (from, until) = window(90);
    coupons
        .create_coupon(CreateCouponInput {
            code: "PARTNER50".into(),
            discount_type: DiscountType::Percentage,
            discount_value: 50,
            valid_from: from,
            valid_until: until,
            usage_limit: Some(1),
            specific_email: Some("partner@example.com".into()),
            is_active: true,
        })
        .await?;

    info!("=== Seed data complete ===");
    Ok(())
}
