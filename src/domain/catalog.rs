//! Catalog entities mirrored from the upstream API
//!
//! The upstream hierarchy is blueprint → print provider → variant. Only the
//! identifiers and titles are interpreted; everything else is carried as an
//! opaque JSON payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The three mirrored entity kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Blueprint,
    Provider,
    Variant,
}

impl EntityKind {
    pub const ALL: [Self; 3] = [Self::Blueprint, Self::Provider, Self::Variant];

    /// Backing table name
    pub const fn table(self) -> &'static str {
        match self {
            Self::Blueprint => "catalog_blueprints",
            Self::Provider => "catalog_providers",
            Self::Variant => "catalog_variants",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Blueprint => "blueprint",
            Self::Provider => "provider",
            Self::Variant => "variant",
        };
        f.write_str(label)
    }
}

/// One item as returned by the upstream API.
///
/// The id is normalised to a string whether upstream sends a number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntity {
    pub id: String,
    pub title: String,
    pub payload: Value,
}

impl CatalogEntity {
    /// Build from a raw upstream object. Returns `None` when no usable `id` is present.
    pub fn from_value(payload: Value) -> Option<Self> {
        let id = match payload.get("id")? {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let title = payload
            .get("title")
            .or_else(|| payload.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Self { id, title, payload })
    }

    /// Label used in progress messages
    pub fn label(&self) -> String {
        if self.title.is_empty() {
            format!("#{}", self.id)
        } else {
            format!("{} (#{})", self.title, self.id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintRecord {
    pub id: String,
    pub title: String,
    pub payload: Value,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    pub blueprint_id: String,
    pub title: String,
    pub payload: Value,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub id: String,
    pub blueprint_id: String,
    pub provider_id: String,
    pub payload: Value,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A record of any kind, as handed to the entity store
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogRecord {
    Blueprint(BlueprintRecord),
    Provider(ProviderRecord),
    Variant(VariantRecord),
}

impl CatalogRecord {
    pub fn blueprint(entity: &CatalogEntity) -> Self {
        Self::Blueprint(BlueprintRecord {
            id: entity.id.clone(),
            title: entity.title.clone(),
            payload: entity.payload.clone(),
            updated_at: None,
        })
    }

    pub fn provider(blueprint_id: &str, entity: &CatalogEntity) -> Self {
        Self::Provider(ProviderRecord {
            id: entity.id.clone(),
            blueprint_id: blueprint_id.to_string(),
            title: entity.title.clone(),
            payload: entity.payload.clone(),
            updated_at: None,
        })
    }

    pub fn variant(blueprint_id: &str, provider_id: &str, entity: &CatalogEntity) -> Self {
        Self::Variant(VariantRecord {
            id: entity.id.clone(),
            blueprint_id: blueprint_id.to_string(),
            provider_id: provider_id.to_string(),
            payload: entity.payload.clone(),
            updated_at: None,
        })
    }

    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Blueprint(_) => EntityKind::Blueprint,
            Self::Provider(_) => EntityKind::Provider,
            Self::Variant(_) => EntityKind::Variant,
        }
    }
}

/// Per-kind statistics for operator visibility
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindSummary {
    pub count: u64,
    pub last_updated: Option<DateTime<Utc>>,
    /// Most recently written row with its payload decoded
    pub sample: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSummary {
    pub blueprints: KindSummary,
    pub providers: KindSummary,
    pub variants: KindSummary,
}

impl CacheSummary {
    pub fn get(&self, kind: EntityKind) -> &KindSummary {
        match kind {
            EntityKind::Blueprint => &self.blueprints,
            EntityKind::Provider => &self.providers,
            EntityKind::Variant => &self.variants,
        }
    }

    pub fn get_mut(&mut self, kind: EntityKind) -> &mut KindSummary {
        match kind {
            EntityKind::Blueprint => &mut self.blueprints,
            EntityKind::Provider => &mut self.providers,
            EntityKind::Variant => &mut self.variants,
        }
    }
}
