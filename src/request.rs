use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::attachment::ImageUpload;
use crate::error::TransportError;
use crate::timeline::Product;

/// Identifies one logical request attempt. Generations only grow, so a stale token
/// can never collide with the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(u64);

impl RequestToken {
    pub fn generation(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Text,
    Image,
    ResetMemory,
}

/// Payload of an outbound request.
#[derive(Debug, Clone)]
pub enum BackendRequest {
    Text { message: String },
    Image(ImageUpload),
    ResetMemory,
}

impl BackendRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            BackendRequest::Text { .. } => RequestKind::Text,
            BackendRequest::Image(_) => RequestKind::Image,
            BackendRequest::ResetMemory => RequestKind::ResetMemory,
        }
    }
}

/// Discriminated backend reply.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendReply {
    Chat { text: String, products: Vec<Product> },
    Recommendation { text: String, products: Vec<Product> },
    ImageSearch { text: String, products: Vec<Product> },
    /// Well-formed JSON whose shape or `type` is not one this request expects.
    Unrecognized,
}

pub type RequestOutcome = Result<BackendReply, TransportError>;

#[derive(Debug, Deserialize)]
struct WireReply {
    #[serde(rename = "type")]
    kind: Option<String>,
    response: Option<String>,
    #[serde(default)]
    products: Option<Value>,
}

/// Decode product entries one at a time. A malformed entry is dropped on its own
/// instead of discarding the reply it came with.
fn decode_products(products: Option<Value>) -> Vec<Product> {
    let items = match products {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => {
            tracing::warn!(products = %other, "ignoring non-array products field");
            return Vec::new();
        }
    };

    items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<Product>(item) {
            Ok(product) => Some(product),
            Err(e) => {
                tracing::warn!(index, error = %e, "skipping malformed product");
                None
            }
        })
        .collect()
}

impl BackendReply {
    /// Classify a decoded JSON body against the kind of request that produced it.
    pub fn classify(kind: RequestKind, body: Value) -> Self {
        let Ok(wire) = serde_json::from_value::<WireReply>(body) else {
            return BackendReply::Unrecognized;
        };
        let (Some(reply_type), Some(text)) = (wire.kind, wire.response) else {
            return BackendReply::Unrecognized;
        };
        let products = decode_products(wire.products);

        match (kind, reply_type.as_str()) {
            (RequestKind::Text | RequestKind::ResetMemory, "chat") => {
                BackendReply::Chat { text, products }
            }
            (RequestKind::Text | RequestKind::ResetMemory, "recommendation") => {
                BackendReply::Recommendation { text, products }
            }
            (RequestKind::Image, "image-search") => BackendReply::ImageSearch { text, products },
            _ => BackendReply::Unrecognized,
        }
    }

    /// Text to reveal and the products to append after it, if this reply streams.
    pub fn into_revealable(self) -> Option<(String, Vec<Product>)> {
        match self {
            BackendReply::Chat { text, products }
            | BackendReply::Recommendation { text, products }
            | BackendReply::ImageSearch { text, products } => Some((text, products)),
            BackendReply::Unrecognized => None,
        }
    }
}

/// Handle given to whoever performs the transport for one request.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub token: RequestToken,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
struct ActiveRequest {
    token: RequestToken,
    kind: RequestKind,
    cancel: CancellationToken,
}

/// Tracks the single logical request allowed at a time.
#[derive(Debug, Default)]
pub struct RequestLifecycle {
    last_generation: u64,
    active: Option<ActiveRequest>,
}

impl RequestLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new request, invalidating any request still active.
    pub fn begin(&mut self, kind: RequestKind) -> Ticket {
        if let Some(previous) = self.active.take() {
            tracing::debug!(
                generation = previous.token.0,
                "superseding active request"
            );
            previous.cancel.cancel();
        }

        self.last_generation += 1;
        let token = RequestToken(self.last_generation);
        let cancel = CancellationToken::new();
        self.active = Some(ActiveRequest {
            token,
            kind,
            cancel: cancel.clone(),
        });

        tracing::debug!(generation = token.0, ?kind, "request started");
        Ticket { token, cancel }
    }

    /// Invalidate `token`. Returns whether it was the active request.
    pub fn cancel(&mut self, token: RequestToken) -> bool {
        match &self.active {
            Some(active) if active.token == token => {
                if let Some(active) = self.active.take() {
                    active.cancel.cancel();
                }
                tracing::debug!(generation = token.0, "request cancelled");
                true
            }
            _ => false,
        }
    }

    /// Accept the transport outcome for `token`. Stale outcomes are dropped and yield `None`.
    pub fn complete(
        &mut self,
        token: RequestToken,
        outcome: RequestOutcome,
    ) -> Option<(RequestKind, RequestOutcome)> {
        match &self.active {
            Some(active) if active.token == token => {
                let active = self.active.take()?;
                Some((active.kind, outcome))
            }
            _ => {
                tracing::debug!(generation = token.0, "discarding stale response");
                None
            }
        }
    }

    pub fn active_token(&self) -> Option<RequestToken> {
        self.active.as_ref().map(|active| active.token)
    }
}
