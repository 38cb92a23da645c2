// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Conversation lifecycle state machine.

use thiserror::Error;

/// Where a conversation is in its turn loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// Created, nothing bound yet
    Init,
    /// Waiting for the simulated user's next message
    AwaitingUserTurn,
    /// Agent invocation in flight
    AwaitingAgentTurn,
    /// Rules and hallucination checks running over the latest turn
    Evaluating,
    /// Final; no event leaves this state
    Terminated,
}

impl ConversationState {
    /// Whether the conversation can still accept events
    pub fn is_live(self) -> bool {
        !matches!(self, ConversationState::Terminated)
    }
}

/// Input driving a [`ConversationState`] transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationEvent {
    /// Persona, test case and rules bound; opening message seeded
    Bound,
    /// Simulated user produced the next message
    UserMessage,
    AgentResponded,
    /// Invocation error, including a caught agent panic
    AgentFailed,
    /// Turn appended and no termination condition met
    TurnRecorded,
    /// A termination condition was met after evaluation
    Finish,
    /// Agent or run deadline passed; accepted from any live state
    Timeout,
    /// Batch cancelled; accepted from any live state
    Cancel,
}

/// An event the current state does not accept
#[derive(Debug, Error)]
#[error("Invalid transition: {current:?} -> {event:?}")]
pub struct InvalidTransition {
    pub current: ConversationState,
    pub event: ConversationEvent,
}

impl ConversationState {
    /// Next state for `event`, or an error when the pair is not allowed.
    /// `self` is left untouched either way.
    pub fn transition(
        self,
        event: ConversationEvent,
    ) -> Result<ConversationState, InvalidTransition> {
        use ConversationEvent::*;
        use ConversationState::*;

        let next = match (self, event) {
            (Init, Bound) => AwaitingAgentTurn,
            (AwaitingAgentTurn, AgentResponded) => Evaluating,
            (AwaitingAgentTurn, AgentFailed) => Terminated,
            (Evaluating, TurnRecorded) => AwaitingUserTurn,
            (Evaluating, Finish) => Terminated,
            (AwaitingUserTurn, UserMessage) => AwaitingAgentTurn,
            (AwaitingUserTurn, Finish) => Terminated,
            (s, Timeout) | (s, Cancel) if s.is_live() => Terminated,
            _ => {
                return Err(InvalidTransition {
                    current: self,
                    event,
                })
            }
        };

        Ok(next)
    }
}
