pub mod clock;
pub mod command;
pub mod flush;
pub mod gateway;
pub mod notifier;
pub mod policy;
pub mod position;
pub mod publisher;
pub mod radio;
pub mod store;
pub mod templates;

pub use clock::GatewayClock;
pub use command::Command;
pub use flush::{FlushWorker, FLUSH_INTERVAL_DEFAULT};
pub use gateway::{spawn_daily_broadcast, Gateway};
pub use notifier::Notifier;
pub use policy::{Decision, PolicyConfig};
pub use position::{PositionCache, PositionFix};
pub use publisher::{NotePublisher, PublishOutcome, PublisherConfig, RATE_LIMIT_DEFAULT};
pub use radio::{AckTransport, ModemFrame, RadioAdapter, RadioConfig, RadioPacket};
pub use store::{Report, ReportStatus, Store};
pub use templates::Lang;
