use std::collections::{HashMap, VecDeque};

use super::message::{opcode, Cookie, TrkCallback, TrkMessage, TrkResult};

/// What the writer should do next.
#[derive(Debug)]
pub enum PendingMessage {
    /// Nothing queued, or a write is still awaiting its answer.
    Empty,
    /// Frame and write this; report back via `notify_write_outcome`.
    Ready(OutgoingFrame),
    /// Head of queue was a barrier. Its callback must be run by the owner.
    SyncBarrier(TrkMessage),
}

/// The wire-relevant part of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFrame {
    pub code: u8,
    pub token: u8,
    pub data: Vec<u8>,
}

/// Callback and cookie detached from the awaiting table, ready to be run
/// outside whatever lock guards the queue.
pub struct PendingCallback {
    callback: Option<TrkCallback>,
    cookie: Cookie,
}

impl PendingCallback {
    pub fn invoke(self, result: &TrkResult) {
        if let Some(callback) = self.callback {
            let mut result = result.clone();
            result.cookie = self.cookie;
            callback(&result);
        }
    }
}

/// FIFO of outbound messages with at most one write in flight. Written
/// messages wait in a token-keyed table until the matching result arrives.
#[derive(Default)]
pub struct WriteQueue {
    queue: VecDeque<TrkMessage>,
    written: HashMap<u8, TrkMessage>,
    write_token: u8,
    write_busy: bool,
    in_flight: Option<u8>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens run 1..=255 and wrap; 0 is reserved.
    fn next_token(&mut self) -> u8 {
        self.write_token = self.write_token.wrapping_add(1);
        if self.write_token == 0 {
            self.write_token = 1;
        }
        self.write_token
    }

    /// Queues a message and returns the token it was assigned.
    pub fn enqueue(
        &mut self,
        code: u8,
        data: Vec<u8>,
        callback: Option<TrkCallback>,
        cookie: Cookie,
    ) -> u8 {
        let token = if code == opcode::SYNC_BARRIER {
            0
        } else {
            self.next_token()
        };
        self.queue.push_back(TrkMessage {
            code,
            token,
            data,
            cookie,
            callback,
        });
        token
    }

    pub fn enqueue_sync_barrier(&mut self, callback: TrkCallback, cookie: Cookie) {
        self.enqueue(opcode::SYNC_BARRIER, Vec::new(), Some(callback), cookie);
    }

    /// The first ping of a session resets the sequence and goes out with token 0.
    pub fn enqueue_initial_ping(&mut self, callback: Option<TrkCallback>) {
        self.write_token = 0;
        self.queue.push_back(TrkMessage {
            callback,
            ..TrkMessage::new(opcode::PING, 0, Vec::new())
        });
    }

    pub fn take_next(&mut self) -> PendingMessage {
        if self.write_busy {
            return PendingMessage::Empty;
        }
        let Some(head) = self.queue.front() else {
            return PendingMessage::Empty;
        };
        if head.is_sync_barrier() {
            return match self.queue.pop_front() {
                Some(message) => PendingMessage::SyncBarrier(message),
                None => PendingMessage::Empty,
            };
        }
        let Some(message) = self.queue.pop_front() else {
            return PendingMessage::Empty;
        };
        let frame = OutgoingFrame {
            code: message.code,
            token: message.token,
            data: message.data.clone(),
        };
        // Registered before the write: the answer may be read before the
        // writer reports its outcome.
        if self.written.insert(message.token, message).is_some() {
            log::warn!("Token {} reused while an earlier message was unanswered", frame.token);
        }
        self.write_busy = true;
        self.in_flight = Some(frame.token);
        PendingMessage::Ready(frame)
    }

    /// Failed writes are dropped, not retried.
    pub fn notify_write_outcome(&mut self, success: bool) {
        let Some(token) = self.in_flight.take() else {
            return;
        };
        if !success {
            if let Some(message) = self.written.remove(&token) {
                log::warn!("Dropping message {:#04x} [{}] after failed write", message.code, token);
            }
            self.write_busy = false;
        }
    }

    /// Frees the write slot and detaches the callback registered for the
    /// result's token. Unmatched tokens yield `None`.
    pub fn take_result_handler(&mut self, result: &TrkResult) -> Option<PendingCallback> {
        if result.is_debug_output {
            return None;
        }
        self.write_busy = false;
        match self.written.remove(&result.token) {
            Some(message) => Some(PendingCallback {
                callback: message.callback,
                cookie: message.cookie,
            }),
            None => {
                log::debug!("No pending message for result token {}", result.token);
                None
            }
        }
    }

    /// Matches the result and runs its callback in place. Returns whether a
    /// pending message was found.
    pub fn on_result_received(&mut self, result: &TrkResult) -> bool {
        match self.take_result_handler(result) {
            Some(handler) => {
                handler.invoke(result);
                true
            }
            None => false,
        }
    }

    /// Drops everything queued or awaiting an answer. Returns the number of
    /// messages discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len() + self.written.len();
        self.queue.clear();
        self.written.clear();
        self.write_busy = false;
        self.in_flight = None;
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn awaiting_len(&self) -> usize {
        self.written.len()
    }

    pub fn is_write_busy(&self) -> bool {
        self.write_busy
    }
}
