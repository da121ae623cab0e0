/// Output of one reveal step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevealEvent {
    /// A strictly longer prefix of the full text.
    Tick(String),
    /// Fired exactly once, after the last tick. Carries the full text.
    Done(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RevealState {
    Running,
    Finished,
    Stopped,
}

/// Typewriter reveal of an already complete string.
///
/// The revealer does not own a timer or a cadence. Whoever drives it calls
/// [`StreamRevealer::advance`] once per tick; in the app that is an `iced::time::every`
/// subscription at the session's configured reveal interval.
#[derive(Debug, Clone)]
pub struct StreamRevealer {
    full_text: String,
    // Byte offset just past each char, so prefixes never split a code point.
    char_ends: Vec<usize>,
    revealed: usize,
    state: RevealState,
}

impl StreamRevealer {
    pub fn start(full_text: impl Into<String>) -> Self {
        let full_text = full_text.into();
        let char_ends = full_text
            .char_indices()
            .map(|(offset, ch)| offset + ch.len_utf8())
            .collect();

        Self {
            full_text,
            char_ends,
            revealed: 0,
            state: RevealState::Running,
        }
    }

    /// Produce the next step, or `None` once finished or stopped.
    pub fn advance(&mut self) -> Option<RevealEvent> {
        if self.state != RevealState::Running {
            return None;
        }

        if self.revealed < self.char_ends.len() {
            let end = self.char_ends[self.revealed];
            self.revealed += 1;
            return Some(RevealEvent::Tick(self.full_text[..end].to_string()));
        }

        self.state = RevealState::Finished;
        Some(RevealEvent::Done(self.full_text.clone()))
    }

    /// Halt the reveal. No tick and no `Done` is produced afterwards.
    pub fn stop(&mut self) {
        if self.state == RevealState::Running {
            self.state = RevealState::Stopped;
        }
    }
}
