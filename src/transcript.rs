//! Transcript reconciliation.
//!
//! The live endpoint delivers two independent speech-to-text streams: what
//! the user said (inputTranscription) and what the model is saying
//! (outputTranscription). Both arrive as partial deltas, arbitrarily
//! interleaved. The reconciler merges them into one append-only log that is
//! always in conversational order: the user's line for a turn is flushed as
//! finalized before the assistant's reply line appears, and at most one
//! partial message exists at the tail, belonging to the current speaker.

use chrono::{DateTime, Local};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug)]
pub struct TranscriptMessage {
    pub id: u64,
    pub role: Role,
    pub text: String,
    /// Still being appended to; mutated in place until finalized.
    pub is_partial: bool,
    pub timestamp: DateTime<Local>,
}

pub struct TranscriptReconciler {
    log: Vec<TranscriptMessage>,
    pending_user: String,
    pending_assistant: String,
    /// Id of the trailing assistant partial, if one exists.
    assistant_partial: Option<u64>,
    next_id: u64,
}

impl TranscriptReconciler {
    pub fn new() -> Self {
        Self {
            log: Vec::new(),
            pending_user: String::new(),
            pending_assistant: String::new(),
            assistant_partial: None,
            next_id: 1,
        }
    }

    fn push_message(&mut self, role: Role, text: String, is_partial: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.log.push(TranscriptMessage {
            id,
            role,
            text,
            is_partial,
            timestamp: Local::now(),
        });
        id
    }

    /// Accumulate a delta of the user's utterance. Not emitted to the log
    /// until flushed by the assistant's first reply delta or turn end.
    pub fn input_delta(&mut self, text: &str) {
        self.pending_user.push_str(text);
    }

    /// Accumulate a delta of the model's utterance. Flushes any pending
    /// user line first so the user's message precedes the reply it
    /// triggered, however the two streams were interleaved on the wire.
    pub fn output_delta(&mut self, text: &str) {
        self.flush_pending_user();
        self.pending_assistant.push_str(text);
        match self.assistant_partial {
            Some(id) => {
                if let Some(entry) = self.log.iter_mut().find(|m| m.id == id) {
                    entry.text = self.pending_assistant.clone();
                }
            }
            None => {
                let id = self.push_message(Role::Assistant, self.pending_assistant.clone(), true);
                self.assistant_partial = Some(id);
            }
        }
    }

    /// Turn boundary: flush the pending user line, finalize the trailing
    /// assistant partial, clear both accumulators.
    pub fn turn_complete(&mut self) {
        self.flush_pending_user();
        if let Some(id) = self.assistant_partial.take() {
            if let Some(entry) = self.log.iter_mut().find(|m| m.id == id) {
                entry.is_partial = false;
            }
        }
        self.pending_assistant.clear();
    }

    /// Barge-in: the model was cut off. The accumulated reply stops here;
    /// whatever made it into the log is finalized as-is and the next delta
    /// starts a fresh message. Finalized messages are never deleted.
    pub fn interrupt(&mut self) {
        self.pending_assistant.clear();
        if let Some(id) = self.assistant_partial.take() {
            if let Some(entry) = self.log.iter_mut().find(|m| m.id == id) {
                entry.is_partial = false;
            }
        }
    }

    /// Teardown: drop both accumulators and close the trailing partial.
    /// The finalized log survives so a conversation remains readable after
    /// disconnect.
    pub fn clear_accumulators(&mut self) {
        self.pending_user.clear();
        self.interrupt();
    }

    /// Full reset: empty log, fresh state. Used when a new session starts.
    pub fn reset(&mut self) {
        self.log.clear();
        self.pending_user.clear();
        self.pending_assistant.clear();
        self.assistant_partial = None;
    }

    fn flush_pending_user(&mut self) {
        if !self.pending_user.is_empty() {
            let text = std::mem::take(&mut self.pending_user);
            self.push_message(Role::User, text, false);
        }
    }

    pub fn messages(&self) -> &[TranscriptMessage] {
        &self.log
    }

    pub fn snapshot(&self) -> Vec<TranscriptMessage> {
        self.log.clone()
    }
}

impl Default for TranscriptReconciler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_line_precedes_assistant_reply() {
        // Streams interleaved: some of the reply's transcript arrives
        // before the tail of the user's.
        let mut rec = TranscriptReconciler::new();
        rec.input_delta("What time ");
        rec.output_delta("It is ");
        rec.input_delta("is it?");
        rec.output_delta("noon.");
        rec.turn_complete();

        let log = rec.messages();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].role, Role::User);
        assert_eq!(log[0].text, "What time ");
        assert_eq!(log[1].role, Role::Assistant);
        // The late user tail flushes at the turn boundary, behind the
        // reply it did not trigger. Turn order only holds when speech
        // does not overlap.
        assert_eq!(log[2].role, Role::User);
        assert!(log.iter().all(|m| !m.is_partial));
    }

    #[test]
    fn simple_turn_is_ordered_user_then_assistant() {
        let mut rec = TranscriptReconciler::new();
        rec.input_delta("Hello there");
        rec.output_delta("Hi!");
        rec.turn_complete();

        let log = rec.messages();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].role, Role::User);
        assert_eq!(log[0].text, "Hello there");
        assert_eq!(log[1].role, Role::Assistant);
        assert_eq!(log[1].text, "Hi!");
    }

    #[test]
    fn output_deltas_collapse_into_one_partial() {
        let mut rec = TranscriptReconciler::new();
        rec.output_delta("Hel");
        rec.output_delta("lo ");
        rec.output_delta("world");

        let partials: Vec<_> = rec.messages().iter().filter(|m| m.is_partial).collect();
        assert_eq!(partials.len(), 1);
        assert_eq!(partials[0].text, "Hello world");
        assert_eq!(rec.messages().len(), 1);
    }

    #[test]
    fn hello_scenario_finalizes_one_assistant_message() {
        let mut rec = TranscriptReconciler::new();
        rec.output_delta("Hel");
        rec.output_delta("lo");
        rec.turn_complete();

        let log = rec.messages();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].role, Role::Assistant);
        assert_eq!(log[0].text, "Hello");
        assert!(!log[0].is_partial);
    }

    #[test]
    fn turn_complete_flushes_user_without_reply() {
        let mut rec = TranscriptReconciler::new();
        rec.input_delta("just me talking");
        rec.turn_complete();

        let log = rec.messages();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].role, Role::User);
        assert!(!log[0].is_partial);
    }

    #[test]
    fn at_most_one_trailing_partial() {
        let mut rec = TranscriptReconciler::new();
        rec.input_delta("one");
        rec.output_delta("reply ");
        rec.output_delta("text");
        let partials = rec.messages().iter().filter(|m| m.is_partial).count();
        assert_eq!(partials, 1);
        assert!(rec.messages().last().unwrap().is_partial);
    }

    #[test]
    fn interrupt_discards_accumulation_but_keeps_log() {
        let mut rec = TranscriptReconciler::new();
        rec.output_delta("I was saying");
        rec.interrupt();

        // The cut-off reply is finalized as-is and stops growing.
        assert_eq!(rec.messages().len(), 1);
        assert!(!rec.messages()[0].is_partial);
        assert_eq!(rec.messages()[0].text, "I was saying");

        // Next delta starts a fresh message, not a continuation.
        rec.output_delta("new reply");
        assert_eq!(rec.messages().len(), 2);
        assert_eq!(rec.messages()[1].text, "new reply");
        assert!(rec.messages()[1].is_partial);
    }

    #[test]
    fn multi_turn_conversation_stays_ordered() {
        let mut rec = TranscriptReconciler::new();
        for turn in 0..3 {
            rec.input_delta(&format!("question {}", turn));
            rec.output_delta(&format!("answer {}", turn));
            rec.turn_complete();
        }
        let log = rec.messages();
        assert_eq!(log.len(), 6);
        for turn in 0..3 {
            assert_eq!(log[turn * 2].role, Role::User);
            assert_eq!(log[turn * 2 + 1].role, Role::Assistant);
        }
    }

    #[test]
    fn reset_empties_everything() {
        let mut rec = TranscriptReconciler::new();
        rec.input_delta("a");
        rec.output_delta("b");
        rec.reset();
        assert!(rec.messages().is_empty());
        // Post-reset deltas behave like a fresh reconciler.
        rec.output_delta("c");
        assert_eq!(rec.messages()[0].text, "c");
    }
}
