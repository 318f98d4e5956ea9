use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::template::{self, Entity as Template, Model as TemplateModel, TemplateStatus},
    errors::ServiceError,
};

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateTemplateInput {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    pub description: Option<String>,
    /// Minor units
    #[validate(range(min = 0))]
    pub price: i64,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    pub status: Option<TemplateStatus>,
    #[validate(range(min = 0))]
    pub stock: Option<i32>,
}

/// Read access to purchasable templates plus the admin create path.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
    default_currency: String,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>, default_currency: impl Into<String>) -> Self {
        Self {
            db,
            default_currency: default_currency.into(),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<TemplateModel>, ServiceError> {
        Template::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::from)
    }

    /// The template, provided it can be sold right now.
    #[instrument(skip(self))]
    pub async fn get_purchasable(&self, id: Uuid) -> Result<TemplateModel, ServiceError> {
        let template = self.get(id).await?.ok_or(ServiceError::TemplateNotFound(id))?;

        if template.status != TemplateStatus::Published {
            return Err(ServiceError::TemplateUnavailable(id));
        }
        if matches!(template.stock, Some(stock) if stock <= 0) {
            return Err(ServiceError::OutOfStock(id));
        }
        Ok(template)
    }

    #[instrument(skip(self, input), fields(title = %input.title))]
    pub async fn create_template(
        &self,
        input: CreateTemplateInput,
    ) -> Result<TemplateModel, ServiceError> {
        input.validate()?;

        let now = Utc::now();
        let model = template::ActiveModel {
            id: Set(Uuid::new_v4()),
            title: Set(input.title.trim().to_string()),
            description: Set(input.description),
            price: Set(input.price),
            currency: Set(input
                .currency
                .map(|c| c.to_uppercase())
                .unwrap_or_else(|| self.default_currency.clone())),
            status: Set(input.status.unwrap_or(TemplateStatus::Published)),
            stock: Set(input.stock),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let created = model.insert(&*self.db).await?;
        info!(template_id = %created.id, "template created");
        Ok(created)
    }
}
