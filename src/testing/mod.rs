//! In-memory `SourceAdapter`/`Transport` test doubles, gated behind the
//! `testing` feature (spec §2's out-of-scope external collaborators get
//! a minimal stand-in here purely so the engine is independently
//! exercisable — see SPEC_FULL.md §2).

mod mock_source;
mod mock_transport;

pub use mock_source::{mock_source, single_use_source_ctor, MockSource, MockSourceHandle};
pub use mock_transport::{mock_transport, single_use_transport_ctor, MockTransport, MockTransportHandle};
