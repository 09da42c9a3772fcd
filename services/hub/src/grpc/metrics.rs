//! Per-RPC server metrics.
//!
//! Counter names and labels follow the common gRPC Prometheus set:
//! `grpc_server_started_total`, `grpc_server_handled_total`,
//! `grpc_server_msg_received_total`, `grpc_server_msg_sent_total` and the
//! `grpc_server_handling_seconds` histogram. They go to whatever recorder is
//! installed; without one they are no-ops.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures_core::Stream;
use metrics::{counter, histogram, Label};
use tonic::Code;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RpcType {
    Unary,
    ServerStream,
}

impl RpcType {
    fn as_str(self) -> &'static str {
        match self {
            RpcType::Unary => "unary",
            RpcType::ServerStream => "server_stream",
        }
    }
}

/// One call, from its start until it is dropped.
///
/// A call dropped without [`RpcMetrics::finish`] was abandoned by the client
/// and is counted as `Cancelled`.
pub(crate) struct RpcMetrics {
    kind: RpcType,
    service: &'static str,
    method: &'static str,
    started: Instant,
    code: Option<Code>,
}

impl RpcMetrics {
    /// Count a started call and its single request message.
    pub(crate) fn start(kind: RpcType, service: &'static str, method: &'static str) -> Self {
        let call = Self {
            kind,
            service,
            method,
            started: Instant::now(),
            code: None,
        };
        counter!("grpc_server_started_total", call.labels()).increment(1);
        counter!("grpc_server_msg_received_total", call.labels()).increment(1);
        call
    }

    fn labels(&self) -> Vec<Label> {
        vec![
            Label::new("grpc_type", self.kind.as_str()),
            Label::new("grpc_service", self.service),
            Label::new("grpc_method", self.method),
        ]
    }

    pub(crate) fn sent(&self) {
        counter!("grpc_server_msg_sent_total", self.labels()).increment(1);
    }

    pub(crate) fn finish(mut self, code: Code) {
        self.code = Some(code);
    }
}

impl Drop for RpcMetrics {
    fn drop(&mut self) {
        let code = self.code.unwrap_or(Code::Cancelled);
        histogram!("grpc_server_handling_seconds", self.labels())
            .record(self.started.elapsed().as_secs_f64());

        let mut labels = self.labels();
        labels.push(Label::new("grpc_code", format!("{code:?}")));
        counter!("grpc_server_handled_total", labels).increment(1);
    }
}

/// A response stream that counts sent messages and finishes the call with
/// `Ok` once exhausted.
pub(crate) struct Metered<S> {
    inner: S,
    call: Option<RpcMetrics>,
}

impl<S> Metered<S> {
    pub(crate) fn new(inner: S, call: RpcMetrics) -> Self {
        Self {
            inner,
            call: Some(call),
        }
    }
}

impl<S, T, E> Stream for Metered<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = std::task::ready!(Pin::new(&mut self.inner).poll_next(cx));
        match &item {
            Some(Ok(_)) => {
                if let Some(call) = &self.call {
                    call.sent();
                }
            }
            Some(Err(_)) => {}
            None => {
                if let Some(call) = self.call.take() {
                    call.finish(Code::Ok);
                }
            }
        }
        Poll::Ready(item)
    }
}
