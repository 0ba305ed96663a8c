pub use rtcall_tokio_transport::{
    ConnectTarget, TokioWebSocketTransportFactory, Transport, TransportEvent, TransportFactory,
};
