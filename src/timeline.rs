use serde::{Deserialize, Deserializer, Serialize};

use crate::error::TimelineError;

/// A catalogue item recommended by the backend. Forwarded verbatim, never edited.
///
/// Every field tolerates being absent or `null`; the backend's catalogue rows are sparse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(default, deserialize_with = "id_from_number_or_string")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub image_path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub category: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub use_cases: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub features: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Int(i64),
    Float(f64),
    Text(String),
}

fn id_from_number_or_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Int(n)) => n.to_string(),
        Some(RawId::Float(n)) => n.to_string(),
        Some(RawId::Text(s)) => s,
        None => String::new(),
    })
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl Product {
    /// Resolve where the card image lives. Absolute URLs pass through, anything else
    /// is served from the backend's `/images` mount.
    pub fn image_url(&self, backend_url: &str) -> String {
        if self.image_path.starts_with("http") {
            return self.image_path.clone();
        }

        let file = match self.image_path.strip_prefix("images/") {
            Some(rest) => rest,
            None => self.image_path.trim_start_matches('/'),
        };

        format!("{}/images/{}", backend_url.trim_end_matches('/'), file)
    }

    pub fn price_label(&self) -> String {
        match self.price {
            Some(price) => format!("${:.2}", price),
            None => "$--".to_string(),
        }
    }
}

/// One displayable unit of the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    UserText { text: String },
    /// Locally materialized preview of an uploaded image, kept even if the upload fails.
    UserImage { preview_uri: String },
    AssistantText { text: String, streaming: bool },
    ProductRef { product: Product },
}

impl TimelineEntry {
    pub fn is_streaming(&self) -> bool {
        matches!(self, TimelineEntry::AssistantText { streaming: true, .. })
    }
}

/// Ordered log of entries. Insertion order is display order.
#[derive(Debug, Default, Clone)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: TimelineEntry) {
        self.entries.push(entry);
    }

    /// Swap the final element. Only used to update or finalize a streaming placeholder.
    pub fn replace_last(&mut self, entry: TimelineEntry) -> Result<(), TimelineError> {
        let last = self
            .entries
            .last_mut()
            .ok_or(TimelineError::EmptyTimeline)?;
        *last = entry;
        Ok(())
    }

    pub fn last(&self) -> Option<&TimelineEntry> {
        self.entries.last()
    }

    /// Read-only view of every entry in display order.
    pub fn snapshot(&self) -> &[TimelineEntry] {
        &self.entries
    }
}
