//! Motor de comunicación colectiva: mueve y combina datos entre instancias de
//! tasks (broadcast, reduce, gather, partition, all-reduce, all-gather y
//! keyed-reduce) sobre un canal de buffers de tamaño fijo.

pub mod assembler;
pub mod buffer;
pub mod channel;
pub mod communicator;
pub mod config;
pub mod error;
pub mod frame;
pub mod operation;
pub mod packer;
pub mod receiver;
pub mod router;

pub use channel::{Channel, EdgeId, LocalChannel, LocalFabric, WakeHandle};
pub use communicator::Communicator;
pub use config::CommsConfig;
pub use error::{CommsError, CommsResult};
pub use operation::{
    CollectingSink, OperationBuilder, OperationKind, OperationPlan, OperationSpec, Sink, SinkEvent,
};
pub use packer::{DataType, KeyValue, PackerRegistry, Value};
pub use receiver::{CombinePolicy, Delivery, Mode, ReduceOp, Reducer};
pub use router::{Router, Topology};
