//! SMTP Finite State Machine implementation.
//!
//! This module provides a proper implementation of the `FiniteStateMachine` trait
//! for SMTP protocol state management. It ensures pure, side-effect-free state
//! transitions using only protocol-level context.

use empath_common::traits::fsm::FiniteStateMachine;

use crate::{command::Command, session_state::SessionState, state::State};

/// Implementation of the `FiniteStateMachine` trait for SMTP protocol states.
///
/// This implementation provides a formal, trait-compliant FSM for SMTP that:
/// - Uses `Command` as the input type
/// - Uses `SessionState` for state (not business `Context`)
/// - Performs pure state transitions without side effects
///
/// # Design Rationale
///
/// By implementing the `FiniteStateMachine` trait, we achieve:
/// - **Polymorphism**: State can be used generically with any FSM code
/// - **Purity**: Transitions are pure functions with no hidden side effects
/// - **Testability**: FSM can be tested in complete isolation
/// - **Separation of Concerns**: Protocol logic separated from business logic
///
/// # Example
///
/// ```rust
/// use empath_common::traits::fsm::FiniteStateMachine;
/// use empath_smtp::{
///     command::{Command, HeloVariant},
///     session_state::SessionState,
///     state::State,
/// };
///
/// let mut session_state = SessionState::new();
/// let state = State::default(); // Connect state
///
/// // Pure FSM transition using the trait method
/// let new_state = FiniteStateMachine::transition(
///     state,
///     Command::Helo(HeloVariant::Ehlo("client.example.com".to_string())),
///     &mut session_state,
/// );
///
/// assert_eq!(session_state.id(), "client.example.com");
/// assert!(session_state.is_extended());
/// ```
impl FiniteStateMachine for State {
    /// SMTP commands are the input to the FSM
    type Input = Command;

    /// Session state contains only FSM state (id, extended, envelope)
    ///
    /// This is intentionally separate from the business `Context` to ensure
    /// pure state transitions without business logic side effects.
    type Context = SessionState;

    /// Performs a pure state transition based on the input command.
    ///
    /// This method delegates to `State::transition_protocol()` which contains
    /// the actual transition logic. The FSM trait implementation provides a
    /// standard interface for generic FSM code.
    ///
    /// # Arguments
    ///
    /// * `input` - The SMTP command to process
    /// * `context` - Mutable protocol context for FSM state
    ///
    /// # Returns
    ///
    /// The new state after the transition
    ///
    /// # Purity
    ///
    /// This function is pure in the sense that:
    /// - It only modifies the protocol context (FSM state)
    /// - It has no side effects on business logic
    /// - It has no I/O operations
    /// - The same input + context always produces the same output
    fn transition(self, input: Self::Input, context: &mut Self::Context) -> Self {
        self.transition_protocol(input, context)
    }
}
