//! Element graph for one bridged call
//!
//! Elements run as async tasks and talk over bounded queues; the
//! [`Pipeline`] links them into a chain and owns their lifecycle:
//! - Each element owns its inbound and outbound queue
//! - Links are standing tasks moving one outlet into the next inlet
//! - Stop cancels, joins every worker, then releases codec contexts
//! - Health counters are kept per element and logged periodically
//!
//! The [`EventBus`] carries out-of-band signals such as barge-in.

pub mod ai_stage;
pub mod bus;
pub mod clock;
pub mod coordinator;
pub mod element;
pub mod health;
pub mod receiver;
pub mod sender;
pub mod state;
pub mod types;

pub use ai_stage::AiBridgeElement;
pub use bus::{Event, EventBus, EventKind};
pub use clock::{FrameClock, Tick};
pub use coordinator::{ElementId, Pipeline};
pub use element::{Element, ElementCore, Inlet, Ports, emit, next_message};
pub use health::{ElementHealth, HealthSummary};
pub use receiver::{AudioResampleElement, OpusDecodeElement, TransportSourceElement};
pub use sender::{OpusEncodeElement, PlayoutElement, TransportSinkElement};
pub use state::ElementState;
pub use types::{AudioData, MediaType, StreamMessage, TextData, Timestamp, VideoData};
