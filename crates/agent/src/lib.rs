//! The conversation lifecycle: from a user message, through tool search and
//! streaming, to an approved (or rejected) tool call and the next round.
//!
//! The machine follows a **search → stream → approve → call** cycle:
//!
//! 1. **Ready**: queued user messages join the conversation
//! 2. **Search**: pick which tools to advertise this round
//! 3. **Stream**: generate a reply, watching for a tool-call envelope
//! 4. **Approve**: a detected call waits for the user
//! 5. **Call**: run the approved tool, append its result, loop back to step 2
//!
//! [`machine`] holds the pure transition function; [`session`] is the async
//! driver that performs its effects.

pub mod machine;
pub mod session;

pub use machine::{transition, ChatEvent, Effect, MachineConfig, Transition};
pub use session::{render_tool_output, ChatSession, SessionError, SessionHandle};
