use agent_protocol::message::CimException;
use parking_lot::Mutex;

/// Counts the outcomes of one request fanned out to `expected` agents.
#[derive(Debug)]
pub struct ResponseAggregator {
    expected: u32,
    state: Mutex<AggregateState>,
}

#[derive(Debug, Default)]
struct AggregateState {
    received: u32,
    exception: Option<CimException>,
}

impl ResponseAggregator {
    pub fn new(expected: u32) -> Self {
        Self { expected, state: Mutex::new(AggregateState::default()) }
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn received(&self) -> u32 {
        self.state.lock().received
    }

    /// Records one outcome (`None` for success). Returns `true` exactly once:
    /// on the call that brings the count to `expected`.
    pub fn is_complete(&self, outcome: Option<&CimException>) -> bool {
        let mut state = self.state.lock();
        if let Some(exception) = outcome {
            state.exception = Some(exception.clone());
        }
        state.received += 1;
        state.received == self.expected
    }

    /// The last failure recorded, or `None` if every outcome so far was a
    /// success.
    pub fn exception(&self) -> Option<CimException> {
        self.state.lock().exception.clone()
    }
}
