use thiserror::Error;

use banter_types::models::MatchedCall;

/// One participant's call lifecycle:
/// idle → searching → connecting → active → post-call → idle.
///
/// Searching can bail back to idle via cancel, but connecting and active
/// always pass through post-call, so the feedback/friend-request step is
/// offered exactly once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Searching,
    Connecting,
    Active,
    PostCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {op} from {from:?}")]
pub struct TransitionError {
    pub from: CallPhase,
    pub op: &'static str,
}

/// The pure state machine behind a voice call client. Transition legality
/// lives here; the surrounding client performs the durable server writes
/// before advancing it.
#[derive(Debug, Clone)]
pub struct CallLifecycle {
    phase: CallPhase,
    call: Option<MatchedCall>,
}

impl CallLifecycle {
    pub fn new() -> Self {
        Self {
            phase: CallPhase::Idle,
            call: None,
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn call(&self) -> Option<&MatchedCall> {
        self.call.as_ref()
    }

    /// idle → searching.
    pub fn begin_search(&mut self) -> Result<(), TransitionError> {
        match self.phase {
            CallPhase::Idle => {
                self.phase = CallPhase::Searching;
                Ok(())
            }
            from => Err(TransitionError { from, op: "begin searching" }),
        }
    }

    /// searching → idle. Only a search can be abandoned directly.
    pub fn cancel_search(&mut self) -> Result<(), TransitionError> {
        match self.phase {
            CallPhase::Searching => {
                self.phase = CallPhase::Idle;
                Ok(())
            }
            from => Err(TransitionError { from, op: "cancel searching" }),
        }
    }

    /// searching → connecting, recording the session data.
    ///
    /// The match can arrive twice — once from this side's own search
    /// response and once as a gateway push. A repeat for the same call is
    /// a no-op so both paths converge; a different call is a protocol
    /// error.
    pub fn matched(&mut self, call: MatchedCall) -> Result<(), TransitionError> {
        match self.phase {
            CallPhase::Searching => {
                self.call = Some(call);
                self.phase = CallPhase::Connecting;
                Ok(())
            }
            CallPhase::Connecting | CallPhase::Active
                if self.call.as_ref().is_some_and(|c| c.call_id == call.call_id) =>
            {
                Ok(())
            }
            from => Err(TransitionError { from, op: "accept a match" }),
        }
    }

    /// connecting → active.
    pub fn connected(&mut self) -> Result<(), TransitionError> {
        match self.phase {
            CallPhase::Connecting => {
                self.phase = CallPhase::Active;
                Ok(())
            }
            from => Err(TransitionError { from, op: "mark connected" }),
        }
    }

    /// connecting|active → post-call. Idempotent: returns true only for
    /// the transition that moved the phase, so hangup, remote call-ended
    /// and a connection failure can all race without double effects.
    pub fn call_over(&mut self) -> bool {
        match self.phase {
            CallPhase::Connecting | CallPhase::Active => {
                self.phase = CallPhase::PostCall;
                true
            }
            _ => false,
        }
    }

    /// post-call → idle, clearing the session data. Reached by dismissing
    /// the post-call step or automatically after feedback submission.
    pub fn dismiss(&mut self) -> Result<(), TransitionError> {
        match self.phase {
            CallPhase::PostCall => {
                self.phase = CallPhase::Idle;
                self.call = None;
                Ok(())
            }
            from => Err(TransitionError { from, op: "dismiss post-call" }),
        }
    }
}

impl Default for CallLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
