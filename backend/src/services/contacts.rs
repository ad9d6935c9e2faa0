// Contact store - read/write capability the automation engine uses on contacts

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Point-in-time view of a contact as seen by conditions and templates
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContactSnapshot {
    pub id: Uuid,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub tags: BTreeSet<String>,
    /// Custom fields keyed by name
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ContactSnapshot {
    pub fn new(id: Uuid) -> Self {
        Self { id, ..Default::default() }
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    pub fn with_field(mut self, name: &str, value: serde_json::Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// JSON document that condition paths and template placeholders resolve against
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Field a step is allowed to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactField {
    Standard(&'static str),
    Custom(String),
}

impl ContactField {
    const STANDARD: [&'static str; 5] = ["email", "first_name", "last_name", "phone", "company"];

    /// `first_name` → standard column, `fields.shirt_size` or `shirt_size` → custom field
    pub fn parse(name: &str) -> Result<Self, ContactStoreError> {
        let name = name.trim();
        if let Some(custom) = name.strip_prefix("fields.") {
            if custom.is_empty() || custom.contains('.') {
                return Err(ContactStoreError::InvalidField(name.to_string()));
            }
            return Ok(Self::Custom(custom.to_string()));
        }
        if name.is_empty() || name == "id" || name == "tags" || name.contains('.') {
            return Err(ContactStoreError::InvalidField(name.to_string()));
        }
        match Self::STANDARD.iter().find(|s| **s == name) {
            Some(column) => Ok(Self::Standard(column)),
            None => Ok(Self::Custom(name.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContactStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Contact {0} not found")]
    NotFound(Uuid),
    #[error("Field '{0}' cannot be written")]
    InvalidField(String),
}

impl ContactStoreError {
    /// Missing contacts and bad fields will not fix themselves on retry
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Database(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Fresh read; `None` if the contact was deleted
    async fn get_contact(&self, id: Uuid) -> Result<Option<ContactSnapshot>, ContactStoreError>;

    /// Adding a tag that is already present is a no-op
    async fn add_tag(&self, id: Uuid, tag: &str) -> Result<(), ContactStoreError>;

    /// Removing an absent tag is a no-op
    async fn remove_tag(&self, id: Uuid, tag: &str) -> Result<(), ContactStoreError>;

    async fn update_field(
        &self,
        id: Uuid,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<(), ContactStoreError>;
}

#[derive(Clone)]
pub struct PgContactStore {
    pool: PgPool,
}

impl PgContactStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn ensure_updated(id: Uuid, rows: u64) -> Result<(), ContactStoreError> {
        if rows == 0 {
            Err(ContactStoreError::NotFound(id))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContactStore for PgContactStore {
    async fn get_contact(&self, id: Uuid) -> Result<Option<ContactSnapshot>, ContactStoreError> {
        let row = sqlx::query_as::<_, (
            Uuid, Option<String>, Option<String>, Option<String>, Option<String>,
            Option<String>, Vec<String>, serde_json::Value,
        )>(
            r#"
            SELECT id, email, first_name, last_name, phone, company, tags, custom_fields
            FROM contacts
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ContactSnapshot {
            id: r.0,
            email: r.1,
            first_name: r.2,
            last_name: r.3,
            phone: r.4,
            company: r.5,
            tags: r.6.into_iter().collect(),
            fields: match r.7 {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
        }))
    }

    async fn add_tag(&self, id: Uuid, tag: &str) -> Result<(), ContactStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE contacts
            SET tags = CASE WHEN $2 = ANY(tags) THEN tags ELSE array_append(tags, $2) END,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(tag)
        .execute(&self.pool)
        .await?;

        Self::ensure_updated(id, result.rows_affected())
    }

    async fn remove_tag(&self, id: Uuid, tag: &str) -> Result<(), ContactStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE contacts
            SET tags = array_remove(tags, $2), updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(tag)
        .execute(&self.pool)
        .await?;

        Self::ensure_updated(id, result.rows_affected())
    }

    async fn update_field(
        &self,
        id: Uuid,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<(), ContactStoreError> {
        let result = match ContactField::parse(field)? {
            ContactField::Standard(column) => {
                let text = match value {
                    serde_json::Value::Null => None,
                    serde_json::Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                };
                // Column name comes from the fixed allow-list above
                let query = format!(
                    "UPDATE contacts SET {column} = $2, updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL"
                );
                sqlx::query(&query).bind(id).bind(text).execute(&self.pool).await?
            }
            ContactField::Custom(name) => {
                sqlx::query(
                    r#"
                    UPDATE contacts
                    SET custom_fields = jsonb_set(custom_fields, ARRAY[$2], $3, true),
                        updated_at = NOW()
                    WHERE id = $1 AND deleted_at IS NULL
                    "#,
                )
                .bind(id)
                .bind(name)
                .bind(value)
                .execute(&self.pool)
                .await?
            }
        };

        Self::ensure_updated(id, result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_contact_field_parsing() {
        assert_eq!(ContactField::parse("first_name").unwrap(), ContactField::Standard("first_name"));
        assert_eq!(
            ContactField::parse("fields.shirt_size").unwrap(),
            ContactField::Custom("shirt_size".to_string())
        );
        assert_eq!(
            ContactField::parse("dietary").unwrap(),
            ContactField::Custom("dietary".to_string())
        );
        assert!(ContactField::parse("").is_err());
        assert!(ContactField::parse("tags").is_err());
        assert!(ContactField::parse("fields.").is_err());
        assert!(ContactField::parse("fields.a.b").is_err());
    }

    #[test]
    fn test_snapshot_document() {
        let contact = ContactSnapshot::new(Uuid::new_v4())
            .with_email("ada@example.com")
            .with_tag("vip")
            .with_field("company_size", json!(42));

        let doc = contact.to_document();
        assert_eq!(doc["email"], "ada@example.com");
        assert_eq!(doc["tags"], json!(["vip"]));
        assert_eq!(doc["fields"]["company_size"], 42);
    }
}
