use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_templates_table::Migration),
            Box::new(m20240601_000002_create_orders_table::Migration),
            Box::new(m20240601_000003_create_download_tokens_table::Migration),
            Box::new(m20240601_000004_create_coupon_tables::Migration),
        ]
    }
}

mod m20240601_000001_create_templates_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_templates_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Templates::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Templates::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Templates::Title).string().not_null())
                        .col(ColumnDef::new(Templates::Description).text().null())
                        .col(ColumnDef::new(Templates::Price).big_integer().not_null())
                        .col(ColumnDef::new(Templates::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Templates::Status).string_len(16).not_null())
                        .col(ColumnDef::new(Templates::Stock).integer().null())
                        .col(
                            ColumnDef::new(Templates::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Templates::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Templates::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Templates {
        Table,
        Id,
        Title,
        Description,
        Price,
        Currency,
        Status,
        Stock,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_orders_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Orders::BuyerId).string().not_null())
                        .col(ColumnDef::new(Orders::BuyerEmail).string().not_null())
                        .col(ColumnDef::new(Orders::BuyerName).string().null())
                        .col(ColumnDef::new(Orders::Items).json().not_null())
                        .col(ColumnDef::new(Orders::SubtotalAmount).big_integer().not_null())
                        .col(
                            ColumnDef::new(Orders::DiscountAmount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::TotalAmount).big_integer().not_null())
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Orders::CouponCode).string().null())
                        .col(ColumnDef::new(Orders::Status).string_len(16).not_null())
                        .col(ColumnDef::new(Orders::Gateway).string_len(32).not_null())
                        .col(
                            ColumnDef::new(Orders::GatewayReference)
                                .string()
                                .null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::PaymentConfirmationId).string().null())
                        .col(ColumnDef::new(Orders::DownloadTokens).json().not_null())
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // Velocity guard read path
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_buyer_status_created")
                        .table(Orders::Table)
                        .col(Orders::BuyerId)
                        .col(Orders::Status)
                        .col(Orders::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        BuyerId,
        BuyerEmail,
        BuyerName,
        Items,
        SubtotalAmount,
        DiscountAmount,
        TotalAmount,
        Currency,
        CouponCode,
        Status,
        Gateway,
        GatewayReference,
        PaymentConfirmationId,
        DownloadTokens,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000003_create_download_tokens_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_download_tokens_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(DownloadTokens::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DownloadTokens::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(DownloadTokens::Token)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(DownloadTokens::BuyerId).string().not_null())
                        .col(ColumnDef::new(DownloadTokens::TemplateId).uuid().not_null())
                        .col(ColumnDef::new(DownloadTokens::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(DownloadTokens::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DownloadTokens::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DownloadTokens::UsedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_download_tokens_order")
                                .from(DownloadTokens::Table, DownloadTokens::OrderId)
                                .to(Orders::Table, Orders::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_download_tokens_order")
                        .table(DownloadTokens::Table)
                        .col(DownloadTokens::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(DownloadTokens::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum DownloadTokens {
        Table,
        Id,
        Token,
        BuyerId,
        TemplateId,
        OrderId,
        ExpiresAt,
        CreatedAt,
        UsedAt,
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
    }
}

mod m20240601_000004_create_coupon_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_coupon_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Coupons::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Coupons::Id).uuid().not_null().primary_key())
                        .col(
                            ColumnDef::new(Coupons::Code)
                                .string_len(64)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Coupons::DiscountType).string_len(16).not_null())
                        .col(ColumnDef::new(Coupons::DiscountValue).big_integer().not_null())
                        .col(ColumnDef::new(Coupons::ValidFrom).json().not_null())
                        .col(ColumnDef::new(Coupons::ValidUntil).json().not_null())
                        .col(ColumnDef::new(Coupons::UsageLimit).integer().null())
                        .col(
                            ColumnDef::new(Coupons::UsedCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Coupons::SpecificEmail).string().null())
                        .col(
                            ColumnDef::new(Coupons::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Coupons::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Coupons::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CouponRedemptions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CouponRedemptions::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(CouponRedemptions::CouponId).uuid().not_null())
                        .col(
                            ColumnDef::new(CouponRedemptions::OrderId)
                                .uuid()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(CouponRedemptions::BuyerId).string().not_null())
                        .col(
                            ColumnDef::new(CouponRedemptions::BuyerEmail)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CouponRedemptions::BuyerName).string().null())
                        .col(
                            ColumnDef::new(CouponRedemptions::Amount)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CouponRedemptions::DiscountApplied)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CouponRedemptions::RedeemedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_coupon_redemptions_coupon")
                                .from(CouponRedemptions::Table, CouponRedemptions::CouponId)
                                .to(Coupons::Table, Coupons::Id),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CouponRedemptions::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Coupons::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Coupons {
        Table,
        Id,
        Code,
        DiscountType,
        DiscountValue,
        ValidFrom,
        ValidUntil,
        UsageLimit,
        UsedCount,
        SpecificEmail,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum CouponRedemptions {
        Table,
        Id,
        CouponId,
        OrderId,
        BuyerId,
        BuyerEmail,
        BuyerName,
        Amount,
        DiscountApplied,
        RedeemedAt,
    }
}
