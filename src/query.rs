// Catalog queries and results. `EntityType` is the closed set of things the
// remote catalog can be searched for; response validation is exhaustive over
// it so a new entity type cannot be added without deciding how its payload
// is shaped.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::error::CatalogError;
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Artist,
    Release,
    Label,
    Marketplace,
}

impl EntityType {
    pub fn name(&self) -> &'static str {
        match self {
            EntityType::Artist => "artist",
            EntityType::Release => "release",
            EntityType::Label => "label",
            EntityType::Marketplace => "marketplace",
        }
    }

    /// Search endpoint path relative to the API base URL. Catalog entities
    /// go through the shared database search; marketplace listings have
    /// their own endpoint.
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            EntityType::Artist | EntityType::Release | EntityType::Label => "/database/search",
            EntityType::Marketplace => "/marketplace/search",
        }
    }

    /// How long a cached response for this entity type stays fresh. Catalog
    /// metadata is long-lived; marketplace listings change price and
    /// availability frequently.
    pub fn cache_ttl(&self) -> Duration {
        match self {
            EntityType::Artist | EntityType::Release | EntityType::Label => {
                Duration::from_secs(30 * 60)
            }
            EntityType::Marketplace => Duration::from_secs(5 * 60),
        }
    }
}

/// A single catalog query, immutable once dispatched. `cursor` is the
/// opaque pagination token from a previous result page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogQuery {
    pub entity: EntityType,
    pub terms: String,
    pub filters: BTreeMap<String, String>,
    pub cursor: Option<String>,
    /// When set, the query lists this artist's releases instead of running
    /// a free-text search; terms and filters are unused.
    pub artist: Option<u64>,
}

impl CatalogQuery {
    pub fn new(entity: EntityType, terms: impl Into<String>) -> Self {
        CatalogQuery {
            entity,
            terms: terms.into(),
            filters: BTreeMap::new(),
            cursor: None,
            artist: None,
        }
    }

    /// Browse one artist's releases by id.
    pub fn artist_releases(artist_id: u64) -> Self {
        let mut query = CatalogQuery::new(EntityType::Release, "");
        query.artist = Some(artist_id);
        query
    }

    /// The same query pointed at a different result page.
    pub fn with_cursor(&self, cursor: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.cursor = Some(cursor.into());
        next
    }

    /// Endpoint path relative to the API base URL.
    pub fn path(&self) -> String {
        match self.artist {
            Some(id) => format!("/artists/{id}/releases"),
            None => self.entity.endpoint_path().to_string(),
        }
    }

    /// Query parameters in wire form. Filter keys are unique by
    /// construction (BTreeMap), so the parameter list is deterministic.
    pub fn params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if self.artist.is_none() {
            params.push(("q".to_string(), self.terms.clone()));
            match self.entity {
                EntityType::Marketplace => {}
                other => params.push(("type".to_string(), other.name().to_string())),
            }
            for (k, v) in &self.filters {
                params.push((k.clone(), v.clone()));
            }
        }
        if let Some(cursor) = &self.cursor {
            params.push(("page".to_string(), cursor.clone()));
        }
        params
    }

    pub fn fingerprint(&self, base_url: &str) -> Fingerprint {
        let url = format!("{}{}", base_url, self.path());
        Fingerprint::of("GET", &url, &self.params())
    }

    /// Validate a response body against the shape this query is expected to
    /// produce. Artist-release listings carry their rows under `releases`;
    /// everything else under `results`.
    pub fn parse(&self, body: &str) -> Result<CatalogResult, CatalogError> {
        let items_key = if self.artist.is_some() { "releases" } else { "results" };
        parse_page(self.entity, items_key, body)
    }

    /// Short human-readable description, used in errors and history.
    pub fn describe(&self) -> String {
        let mut out = match self.artist {
            Some(id) => format!("releases of artist {id}"),
            None => format!("{} \"{}\"", self.entity.name(), self.terms),
        };
        for (k, v) in &self.filters {
            out.push_str(&format!(" {}={}", k, v));
        }
        if let Some(cursor) = &self.cursor {
            out.push_str(&format!(" (page {})", cursor));
        }
        out
    }
}

/// One row of a result page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub id: u64,
    pub title: String,
    /// Entity-specific extra column: release year, label catalog number,
    /// listing price. Absent when the payload doesn't carry it.
    pub detail: Option<String>,
}

/// A validated result page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogResult {
    pub entity: EntityType,
    pub total: u64,
    pub items: Vec<Summary>,
    pub next_cursor: Option<String>,
}

/// Validate a raw search response against the shape this entity type is
/// expected to produce. Any missing required field is `Malformed`; the
/// response is rejected as a whole rather than partially accepted.
pub fn parse_response(entity: EntityType, body: &str) -> Result<CatalogResult, CatalogError> {
    parse_page(entity, "results", body)
}

fn parse_page(
    entity: EntityType,
    items_key: &str,
    body: &str,
) -> Result<CatalogResult, CatalogError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| CatalogError::Malformed(format!("response is not valid JSON: {e}")))?;

    let pagination = value
        .get("pagination")
        .ok_or_else(|| CatalogError::Malformed("missing `pagination`".into()))?;
    let total = pagination
        .get("items")
        .and_then(Value::as_u64)
        .ok_or_else(|| CatalogError::Malformed("missing `pagination.items`".into()))?;
    let page = pagination.get("page").and_then(Value::as_u64);
    let pages = pagination.get("pages").and_then(Value::as_u64);

    let results = value
        .get(items_key)
        .and_then(Value::as_array)
        .ok_or_else(|| CatalogError::Malformed(format!("missing `{items_key}` array")))?;

    let mut items = Vec::with_capacity(results.len());
    for (idx, item) in results.iter().enumerate() {
        items.push(summarize(entity, idx, item)?);
    }

    let next_cursor = match (page, pages) {
        (Some(p), Some(n)) if p < n => Some((p + 1).to_string()),
        _ => None,
    };

    Ok(CatalogResult { entity, total, items, next_cursor })
}

fn summarize(entity: EntityType, idx: usize, item: &Value) -> Result<Summary, CatalogError> {
    let id = item
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| CatalogError::Malformed(format!("result {idx} missing `id`")))?;
    let title = item
        .get("title")
        .and_then(Value::as_str)
        .ok_or_else(|| CatalogError::Malformed(format!("result {idx} missing `title`")))?
        .to_string();

    // The detail column is entity-specific and best-effort; only id and
    // title are required everywhere.
    let detail = match entity {
        EntityType::Artist => item
            .get("uri")
            .and_then(Value::as_str)
            .map(str::to_string),
        EntityType::Release => field_as_string(item, "year"),
        EntityType::Label => item
            .get("catno")
            .and_then(Value::as_str)
            .map(str::to_string),
        EntityType::Marketplace => item
            .get("price")
            .map(|p| match p {
                Value::String(s) => s.clone(),
                Value::Object(o) => match (o.get("value"), o.get("currency")) {
                    (Some(v), Some(Value::String(c))) => format!("{v} {c}"),
                    _ => p.to_string(),
                },
                other => other.to_string(),
            }),
    };

    Ok(Summary { id, title, detail })
}

// Search payloads carry the year as either a number or a string.
fn field_as_string(item: &Value, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
