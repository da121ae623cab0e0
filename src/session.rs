use std::time::Duration;

use crate::attachment::ImageUpload;
use crate::error::{MaterializeError, TransportError};
use crate::request::{
    BackendRequest, RequestKind, RequestLifecycle, RequestOutcome, RequestToken, Ticket,
};
use crate::reveal::{RevealEvent, StreamRevealer};
use crate::timeline::{Timeline, TimelineEntry};

pub const CHAT_FAILURE_NOTICE: &str = "Failed to contact backend.";
pub const IMAGE_FAILURE_NOTICE: &str = "Image search failed.";
pub const ATTACHMENT_FAILURE_NOTICE: &str = "Could not read image file.";
pub const UNEXPECTED_IMAGE_REPLY: &str = "Unexpected image search response.";
pub const UNEXPECTED_CHAT_REPLY: &str = "Unexpected chat response.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingResponse,
    Revealing,
}

/// One-shot, user-visible error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub message: String,
}

/// Read-only projection handed to the renderer. Borrows the timeline, so the renderer
/// can look at it every frame without copying image previews.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionView<'a> {
    pub entries: &'a [TimelineEntry],
    pub phase: Phase,
}

/// A request the caller must perform, reporting back through [`Session::on_result`].
#[derive(Debug, Clone)]
pub struct Outbound {
    pub ticket: Ticket,
    pub request: BackendRequest,
}

/// Owns the timeline and sequences requests, reveals and cancellation.
///
/// Every method is a handler for one external event and runs to completion, so the
/// timeline is never observed half-updated.
#[derive(Debug)]
pub struct Session {
    timeline: Timeline,
    phase: Phase,
    requests: RequestLifecycle,
    revealer: Option<StreamRevealer>,
    // Products waiting for the current reveal to finish.
    pending_follow_ups: Option<Vec<TimelineEntry>>,
    notice: Option<Notice>,
    reveal_interval: Duration,
}

impl Session {
    pub fn new(reveal_interval: Duration) -> Self {
        Session {
            timeline: Timeline::new(),
            phase: Phase::Idle,
            requests: RequestLifecycle::new(),
            revealer: None,
            pending_follow_ups: None,
            notice: None,
            reveal_interval,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn reveal_interval(&self) -> Duration {
        self.reveal_interval
    }

    #[cfg(test)]
    pub fn active_token(&self) -> Option<RequestToken> {
        self.requests.active_token()
    }

    pub fn snapshot(&self) -> SessionView<'_> {
        SessionView {
            entries: self.timeline.snapshot(),
            phase: self.phase,
        }
    }

    /// Hand the pending notice to the presentation layer, at most once.
    pub fn take_notice(&mut self) -> Option<Notice> {
        self.notice.take()
    }

    pub fn send_text(&mut self, text: &str) -> Option<Outbound> {
        if self.phase != Phase::Idle {
            tracing::debug!(phase = ?self.phase, "ignoring text while busy");
            return None;
        }
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        self.timeline.append(TimelineEntry::UserText {
            text: text.to_string(),
        });
        Some(self.begin(BackendRequest::Text {
            message: text.to_string(),
        }))
    }

    /// `upload` has already been materialized, so its preview is shown even if the
    /// upload later fails.
    pub fn send_image(&mut self, upload: ImageUpload) -> Option<Outbound> {
        if self.phase != Phase::Idle {
            tracing::debug!(phase = ?self.phase, "ignoring image while busy");
            return None;
        }

        self.timeline.append(TimelineEntry::UserImage {
            preview_uri: upload.preview_uri.clone(),
        });
        Some(self.begin(BackendRequest::Image(upload)))
    }

    /// Ask the backend to forget the conversation. Adds no user entry.
    pub fn reset_memory(&mut self) -> Option<Outbound> {
        if self.phase != Phase::Idle {
            return None;
        }
        Some(self.begin(BackendRequest::ResetMemory))
    }

    pub fn report_attachment_failure(&mut self, err: &MaterializeError) {
        tracing::warn!("image materialization failed: {}", err);
        self.notify(ATTACHMENT_FAILURE_NOTICE);
    }

    pub fn on_result(&mut self, token: RequestToken, outcome: RequestOutcome) {
        let Some((kind, outcome)) = self.requests.complete(token, outcome) else {
            return;
        };
        debug_assert_eq!(self.phase, Phase::AwaitingResponse);

        let reply = match outcome {
            Ok(reply) => reply,
            Err(TransportError::Cancelled) => {
                self.set_phase(Phase::Idle);
                return;
            }
            Err(e) => {
                tracing::warn!(generation = token.generation(), ?kind, "request failed: {}", e);
                self.notify(match kind {
                    RequestKind::Image => IMAGE_FAILURE_NOTICE,
                    RequestKind::Text | RequestKind::ResetMemory => CHAT_FAILURE_NOTICE,
                });
                self.set_phase(Phase::Idle);
                return;
            }
        };

        match reply.into_revealable() {
            Some((text, products)) => {
                self.timeline.append(TimelineEntry::AssistantText {
                    text: String::new(),
                    streaming: true,
                });
                self.pending_follow_ups = Some(
                    products
                        .into_iter()
                        .map(|product| TimelineEntry::ProductRef { product })
                        .collect(),
                );
                self.revealer = Some(StreamRevealer::start(text));
                self.set_phase(Phase::Revealing);
                // First character shows up right away, and empty text finishes here.
                self.on_reveal_tick();
            }
            None => {
                let notice = match kind {
                    RequestKind::Image => UNEXPECTED_IMAGE_REPLY,
                    RequestKind::Text | RequestKind::ResetMemory => UNEXPECTED_CHAT_REPLY,
                };
                self.timeline.append(TimelineEntry::AssistantText {
                    text: notice.to_string(),
                    streaming: false,
                });
                self.set_phase(Phase::Idle);
            }
        }
    }

    /// Advance the reveal by one step. Late ticks after a stop or finish do nothing.
    pub fn on_reveal_tick(&mut self) {
        if self.phase != Phase::Revealing {
            return;
        }
        let Some(event) = self.revealer.as_mut().and_then(StreamRevealer::advance) else {
            return;
        };

        match event {
            RevealEvent::Tick(partial) => {
                self.replace_streaming(TimelineEntry::AssistantText {
                    text: partial,
                    streaming: true,
                });
            }
            RevealEvent::Done(full_text) => {
                self.replace_streaming(TimelineEntry::AssistantText {
                    text: full_text,
                    streaming: false,
                });
                self.revealer = None;
                for entry in self.pending_follow_ups.take().unwrap_or_default() {
                    self.timeline.append(entry);
                }
                self.set_phase(Phase::Idle);
            }
        }
    }

    /// Cancel whatever is in flight. The user's own entries stay where they are.
    pub fn stop(&mut self) {
        match self.phase {
            Phase::Idle => return,
            Phase::AwaitingResponse => {
                if let Some(token) = self.requests.active_token() {
                    self.requests.cancel(token);
                }
            }
            Phase::Revealing => {
                if let Some(mut revealer) = self.revealer.take() {
                    revealer.stop();
                }
                self.pending_follow_ups = None;
                // Freeze the partial reply so no streaming entry outlives the reveal.
                if let Some(TimelineEntry::AssistantText {
                    text,
                    streaming: true,
                }) = self.timeline.last()
                {
                    let text = text.clone();
                    self.replace_streaming(TimelineEntry::AssistantText {
                        text,
                        streaming: false,
                    });
                }
            }
        }
        self.set_phase(Phase::Idle);
    }

    fn begin(&mut self, request: BackendRequest) -> Outbound {
        let ticket = self.requests.begin(request.kind());
        self.set_phase(Phase::AwaitingResponse);
        Outbound { ticket, request }
    }

    fn replace_streaming(&mut self, entry: TimelineEntry) {
        debug_assert!(
            self.timeline.last().is_some_and(TimelineEntry::is_streaming),
            "streaming placeholder must be the last entry"
        );
        if let Err(e) = self.timeline.replace_last(entry) {
            tracing::error!("timeline invariant violated: {}", e);
            debug_assert!(false, "{}", e);
        }
    }

    fn notify(&mut self, message: &str) {
        self.notice = Some(Notice {
            message: message.to_string(),
        });
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "session phase changed");
        }
        self.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::BackendReply;
    use crate::timeline::Product;
    use pretty_assertions::assert_eq;

    fn session() -> Session {
        Session::new(Duration::from_millis(18))
    }

    fn product(id: &str) -> Product {
        Product {
            id: id.to_string(),
            name: format!("Product {}", id),
            description: String::new(),
            price: Some(10.0),
            image_path: format!("images/{}.jpg", id),
            category: "bags".to_string(),
            tags: vec![],
            use_cases: vec![],
            features: vec![],
        }
    }

    fn upload() -> ImageUpload {
        ImageUpload {
            filename: "shoe.png".to_string(),
            mime: "image/png".to_string(),
            bytes: vec![1, 2, 3],
            preview_uri: "data:image/png;base64,AQID".to_string(),
        }
    }

    fn reveal_to_end(session: &mut Session) -> usize {
        let mut ticks = 0;
        while session.phase() == Phase::Revealing {
            session.on_reveal_tick();
            ticks += 1;
            assert!(ticks < 10_000, "reveal never finished");
        }
        ticks
    }

    fn assert_streaming_invariant(session: &Session) {
        let entries = session.snapshot().entries;
        let streaming: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_streaming())
            .map(|(i, _)| i)
            .collect();
        assert!(streaming.len() <= 1);
        if let Some(&index) = streaming.first() {
            assert_eq!(index, entries.len() - 1);
        }
        assert_eq!(
            session.active_token().is_some(),
            session.phase() == Phase::AwaitingResponse
        );
    }

    #[test]
    fn test_scenario_text_reply_with_product() {
        let mut session = session();
        let outbound = session.send_text("find me a red bag").unwrap();
        assert_eq!(session.phase(), Phase::AwaitingResponse);
        assert_eq!(
            session.snapshot().entries,
            vec![TimelineEntry::UserText {
                text: "find me a red bag".to_string()
            }]
        );

        session.on_result(
            outbound.ticket.token,
            Ok(BackendReply::Chat {
                text: "Here is a red bag".to_string(),
                products: vec![product("1")],
            }),
        );
        assert_eq!(session.phase(), Phase::Revealing);
        assert_eq!(
            session.snapshot().entries[1],
            TimelineEntry::AssistantText {
                text: "H".to_string(),
                streaming: true
            }
        );

        reveal_to_end(&mut session);

        assert_eq!(
            session.snapshot(),
            SessionView {
                entries: &[
                    TimelineEntry::UserText {
                        text: "find me a red bag".to_string()
                    },
                    TimelineEntry::AssistantText {
                        text: "Here is a red bag".to_string(),
                        streaming: false
                    },
                    TimelineEntry::ProductRef {
                        product: product("1")
                    },
                ],
                phase: Phase::Idle,
            }
        );
        assert!(session.take_notice().is_none());
    }

    #[test]
    fn test_scenario_stop_before_response() {
        let mut session = session();
        let outbound = session.send_text("hi").unwrap();

        session.stop();
        assert_eq!(session.phase(), Phase::Idle);
        assert!(outbound.ticket.cancel.is_cancelled());

        session.on_result(
            outbound.ticket.token,
            Ok(BackendReply::Chat {
                text: "hello".to_string(),
                products: vec![],
            }),
        );

        assert_eq!(
            session.snapshot(),
            SessionView {
                entries: &[TimelineEntry::UserText {
                    text: "hi".to_string()
                }],
                phase: Phase::Idle,
            }
        );
    }

    #[test]
    fn test_scenario_unrecognized_image_reply() {
        let mut session = session();
        let outbound = session.send_image(upload()).unwrap();

        session.on_result(outbound.ticket.token, Ok(BackendReply::Unrecognized));

        assert_eq!(
            session.snapshot(),
            SessionView {
                entries: &[
                    TimelineEntry::UserImage {
                        preview_uri: "data:image/png;base64,AQID".to_string()
                    },
                    TimelineEntry::AssistantText {
                        text: UNEXPECTED_IMAGE_REPLY.to_string(),
                        streaming: false
                    },
                ],
                phase: Phase::Idle,
            }
        );
    }

    #[test]
    fn test_unrecognized_chat_reply_is_final_message() {
        let mut session = session();
        let outbound = session.send_text("hi").unwrap();
        session.on_result(outbound.ticket.token, Ok(BackendReply::Unrecognized));

        assert_eq!(
            session.snapshot(),
            SessionView {
                entries: &[
                    TimelineEntry::UserText {
                        text: "hi".to_string()
                    },
                    TimelineEntry::AssistantText {
                        text: UNEXPECTED_CHAT_REPLY.to_string(),
                        streaming: false
                    },
                ],
                phase: Phase::Idle,
            }
        );
        assert_eq!(session.take_notice(), None);
        assert_eq!(session.active_token(), None);

        // Reset memory goes through the same path, with no user entry of its own.
        let outbound = session.reset_memory().unwrap();
        session.on_result(outbound.ticket.token, Ok(BackendReply::Unrecognized));
        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.snapshot().entries.len(), 3);
        assert_eq!(
            session.snapshot().entries.last(),
            Some(&TimelineEntry::AssistantText {
                text: UNEXPECTED_CHAT_REPLY.to_string(),
                streaming: false
            })
        );
        assert_eq!(session.take_notice(), None);
        assert_streaming_invariant(&session);
    }

    #[test]
    fn test_image_reply_streams_with_products_in_order() {
        let mut session = session();
        let outbound = session.send_image(upload()).unwrap();
        session.on_result(
            outbound.ticket.token,
            Ok(BackendReply::ImageSearch {
                text: "Similar shoes".to_string(),
                products: vec![product("3"), product("1"), product("2")],
            }),
        );

        // Products stay queued for the whole reveal.
        while session.phase() == Phase::Revealing {
            let entries = session.snapshot().entries;
            assert!(entries
                .iter()
                .all(|e| !matches!(e, TimelineEntry::ProductRef { .. })));
            assert_streaming_invariant(&session);
            session.on_reveal_tick();
        }

        let entries = session.snapshot().entries;
        let ids: Vec<&str> = entries
            .iter()
            .filter_map(|e| match e {
                TimelineEntry::ProductRef { product } => Some(product.id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["3", "1", "2"]);
        assert_eq!(
            entries[1],
            TimelineEntry::AssistantText {
                text: "Similar shoes".to_string(),
                streaming: false
            }
        );
    }

    #[test]
    fn test_reveal_tick_count_matches_text_length() {
        let mut session = session();
        let outbound = session.send_text("q").unwrap();
        session.on_result(
            outbound.ticket.token,
            Ok(BackendReply::Recommendation {
                text: "abcd".to_string(),
                products: vec![],
            }),
        );

        // One tick already happened on arrival; three more chars, then done.
        assert_eq!(reveal_to_end(&mut session), 4);
        assert_eq!(session.snapshot().entries.len(), 2);
    }

    #[test]
    fn test_empty_reply_finalizes_immediately() {
        let mut session = session();
        let outbound = session.send_text("q").unwrap();
        session.on_result(
            outbound.ticket.token,
            Ok(BackendReply::Chat {
                text: String::new(),
                products: vec![product("9")],
            }),
        );

        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(
            session.snapshot().entries[1..].to_vec(),
            vec![
                TimelineEntry::AssistantText {
                    text: String::new(),
                    streaming: false
                },
                TimelineEntry::ProductRef {
                    product: product("9")
                },
            ]
        );
    }

    #[test]
    fn test_stop_during_reveal_freezes_entry_and_drops_products() {
        let mut session = session();
        let outbound = session.send_text("q").unwrap();
        session.on_result(
            outbound.ticket.token,
            Ok(BackendReply::Chat {
                text: "Hello there".to_string(),
                products: vec![product("1")],
            }),
        );
        session.on_reveal_tick();
        session.on_reveal_tick();

        session.stop();
        assert_eq!(session.phase(), Phase::Idle);
        let frozen = session.snapshot().entries.to_vec();
        assert_eq!(
            frozen.last(),
            Some(&TimelineEntry::AssistantText {
                text: "Hel".to_string(),
                streaming: false
            })
        );

        // Late ticks from the stopped reveal change nothing.
        for _ in 0..20 {
            session.on_reveal_tick();
        }
        assert_eq!(session.snapshot().entries, frozen);
        assert_eq!(session.phase(), Phase::Idle);
        assert_streaming_invariant(&session);
    }

    #[test]
    fn test_transport_failure_notifies_once() {
        let mut session = session();
        let outbound = session.send_text("hi").unwrap();
        session.on_result(
            outbound.ticket.token,
            Err(TransportError::Network("refused".to_string())),
        );

        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(
            session.take_notice(),
            Some(Notice {
                message: CHAT_FAILURE_NOTICE.to_string()
            })
        );
        assert_eq!(session.take_notice(), None);
        assert_eq!(session.snapshot().entries.len(), 1);
    }

    #[test]
    fn test_image_transport_failure_keeps_preview() {
        let mut session = session();
        let outbound = session.send_image(upload()).unwrap();
        session.on_result(
            outbound.ticket.token,
            Err(TransportError::Status {
                status: 502,
                body: String::new(),
            }),
        );

        assert_eq!(
            session.take_notice().map(|n| n.message),
            Some(IMAGE_FAILURE_NOTICE.to_string())
        );
        assert!(matches!(
            session.snapshot().entries,
            [TimelineEntry::UserImage { .. }]
        ));
    }

    #[test]
    fn test_stale_failure_after_stop_is_silent() {
        let mut session = session();
        let outbound = session.send_text("hi").unwrap();
        session.stop();

        session.on_result(
            outbound.ticket.token,
            Err(TransportError::Network("late".to_string())),
        );
        assert_eq!(session.take_notice(), None);
        assert_eq!(session.snapshot().entries.len(), 1);
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn test_cancelled_outcome_is_not_an_error() {
        let mut session = session();
        let outbound = session.send_text("hi").unwrap();
        session.on_result(outbound.ticket.token, Err(TransportError::Cancelled));

        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.take_notice(), None);
    }

    #[test]
    fn test_stale_reply_does_not_touch_newer_request() {
        let mut session = session();
        let first = session.send_text("one").unwrap();
        session.stop();
        let second = session.send_text("two").unwrap();

        session.on_result(
            first.ticket.token,
            Ok(BackendReply::Chat {
                text: "for one".to_string(),
                products: vec![],
            }),
        );
        assert_eq!(session.phase(), Phase::AwaitingResponse);
        assert_eq!(session.active_token(), Some(second.ticket.token));
        assert_eq!(session.snapshot().entries.len(), 2);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut session = session();
        session.stop();
        assert_eq!(session.snapshot(), SessionView { entries: &[], phase: Phase::Idle });

        let outbound = session.send_text("hi").unwrap();
        session.on_result(
            outbound.ticket.token,
            Ok(BackendReply::Chat {
                text: "ok".to_string(),
                products: vec![],
            }),
        );
        reveal_to_end(&mut session);
        let before = session.snapshot().entries.to_vec();
        session.stop();
        assert_eq!(session.snapshot().entries, before);
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn test_intents_rejected_while_busy() {
        let mut session = session();
        assert!(session.send_text("   ").is_none());
        assert!(session.snapshot().entries.is_empty());

        let outbound = session.send_text("first").unwrap();
        assert!(session.send_text("second").is_none());
        assert!(session.send_image(upload()).is_none());
        assert!(session.reset_memory().is_none());
        assert_eq!(session.active_token(), Some(outbound.ticket.token));

        session.on_result(
            outbound.ticket.token,
            Ok(BackendReply::Chat {
                text: "reply".to_string(),
                products: vec![],
            }),
        );
        assert_eq!(session.phase(), Phase::Revealing);
        assert!(session.send_text("third").is_none());
        assert_eq!(session.snapshot().entries.len(), 2);
    }

    #[test]
    fn test_reset_memory_reveals_reply_without_user_entry() {
        let mut session = session();
        let outbound = session.reset_memory().unwrap();
        assert!(matches!(outbound.request, BackendRequest::ResetMemory));

        session.on_result(
            outbound.ticket.token,
            Ok(BackendReply::Chat {
                text: "Memory for 127.0.0.1 cleared.".to_string(),
                products: vec![],
            }),
        );
        reveal_to_end(&mut session);

        assert_eq!(
            session.snapshot().entries,
            vec![TimelineEntry::AssistantText {
                text: "Memory for 127.0.0.1 cleared.".to_string(),
                streaming: false
            }]
        );
    }

    #[test]
    fn test_attachment_failure_notifies_without_request() {
        let mut session = session();
        let err = MaterializeError::UnsupportedFormat("notes.txt".into());
        session.report_attachment_failure(&err);

        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.active_token(), None);
        assert!(session.snapshot().entries.is_empty());
        assert_eq!(
            session.take_notice().map(|n| n.message),
            Some(ATTACHMENT_FAILURE_NOTICE.to_string())
        );
    }

    #[test]
    fn test_user_text_precedes_assistant_for_many_inputs() {
        for text in ["a", "hello world", "ünïcödé ✓", "multi\nline"] {
            let mut session = session();
            let outbound = session.send_text(text).unwrap();
            session.on_result(
                outbound.ticket.token,
                Ok(BackendReply::Chat {
                    text: text.chars().rev().collect(),
                    products: vec![],
                }),
            );
            reveal_to_end(&mut session);

            let entries = session.snapshot().entries;
            assert_eq!(
                entries[0],
                TimelineEntry::UserText {
                    text: text.to_string()
                }
            );
            assert!(matches!(
                entries[1],
                TimelineEntry::AssistantText {
                    streaming: false,
                    ..
                }
            ));
        }
    }
}
