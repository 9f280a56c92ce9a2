//! Proxy server loop.
//!
//! Reads one request line at a time, executes it, writes one response line and
//! flushes. Strictly sequential: request N+1 is not read until response N is written.
//! Any failure ends the loop; the client sees the closed pipe and reports a broken channel.
//! SIGTERM or SIGINT stops the server and tears down the subprocess of a call in flight.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{self, DecodeError, EncodeError, FrameError, LineCodec};
use crate::bridge::protocol::Request;
use crate::config::ServerConfig;
use crate::diagnostics::DiagnosticLog;
use crate::executor::{Executor, ExecutorError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bad request: {0}")]
    Decode(#[from] DecodeError),
    #[error("cannot encode response: {0}")]
    Encode(#[from] EncodeError),
    #[error("execution failed: {0}")]
    Executor(#[from] ExecutorError),
    #[error("channel error: {0}")]
    Channel(FrameError),
}

impl From<FrameError> for ServerError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Decode(e) => Self::Decode(e),
            FrameError::Encode(e) => Self::Encode(e),
            other => Self::Channel(other),
        }
    }
}

/// Serve requests from `reader` until it reaches end of stream.
///
/// Returns `Ok(())` on a clean end of stream and the first error otherwise.
pub async fn serve<R, W, E>(
    reader: R,
    writer: W,
    executor: &E,
    config: &ServerConfig,
    diagnostics: &DiagnosticLog,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: Executor + ?Sized,
{
    let mut reader = FramedRead::new(reader, LineCodec::with_max_length(config.max_frame_length));
    let mut writer = FramedWrite::new(writer, LineCodec::with_max_length(config.max_frame_length));

    diagnostics.mark("Starting");
    tracing::debug!(max_frame_length = config.max_frame_length, "Proxy server ready");

    let result: Result<(), ServerError> = async {
        let mut served: u64 = 0;
        while let Some(line) = reader.next().await {
            let line = line?;
            diagnostics.record("stdin", &line);

            let request: Request = codec::decode(&line)?;
            tracing::debug!(
                args = request.args.len(),
                kwargs = request.kwargs.len(),
                "Executing request"
            );
            let response = executor.execute(request).await?;
            diagnostics.record_response(&response);

            let out = codec::encode(&response)?;
            diagnostics.record("stdout", &out);
            writer.send(out).await?;
            served += 1;
        }
        tracing::debug!(served, "Input closed, shutting down");
        Ok(())
    }
    .await;

    if let Err(ref e) = result {
        tracing::error!(error = %e, "Proxy server stopping");
        diagnostics.record("error", e);
    }
    diagnostics.mark("Exiting");
    result
}

/// Like [`serve`], but returns `Ok(())` as soon as `shutdown` resolves.
///
/// A request still executing is dropped, which kills its subprocess group.
pub async fn serve_until<R, W, E, F>(
    reader: R,
    writer: W,
    executor: &E,
    config: &ServerConfig,
    diagnostics: &DiagnosticLog,
    shutdown: F,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: Executor + ?Sized,
    F: Future<Output = ()>,
{
    tokio::select! {
        result = serve(reader, writer, executor, config, diagnostics) => result,
        () = shutdown => {
            diagnostics.mark("Interrupted");
            Ok(())
        }
    }
}

/// Serve over the process's stdin/stdout until input closes or a termination signal arrives.
pub async fn run_server<E: Executor + ?Sized>(
    executor: &E,
    config: ServerConfig,
) -> Result<(), ServerError> {
    let diagnostics = DiagnosticLog::open_or_disabled(&config.diagnostics);
    serve_until(
        tokio::io::stdin(),
        tokio::io::stdout(),
        executor,
        &config,
        &diagnostics,
        shutdown_signal(),
    )
    .await
}

/// Resolves on SIGINT or SIGTERM. A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::bridge::protocol::{Response, Value};
    use crate::config::DiagnosticsConfig;

    /// Echoes the first positional argument back as stdout.
    #[derive(Default)]
    struct EchoExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Executor for EchoExecutor {
        async fn execute(&self, request: Request) -> Result<Response, ExecutorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
            let stdout = request
                .args
                .first()
                .and_then(Value::as_byte_slice)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            Ok(Response::new(100 + n, 0, stdout, Vec::new()))
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl Executor for FailingExecutor {
        async fn execute(&self, _request: Request) -> Result<Response, ExecutorError> {
            Err(ExecutorError::invalid("'cmd' must name a program"))
        }
    }

    /// Never finishes; counts how many executions were dropped.
    #[derive(Default)]
    struct HangingExecutor {
        dropped: Arc<AtomicUsize>,
    }

    struct CountOnDrop(Arc<AtomicUsize>);

    impl Drop for CountOnDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Executor for HangingExecutor {
        async fn execute(&self, _request: Request) -> Result<Response, ExecutorError> {
            let _count = CountOnDrop(self.dropped.clone());
            std::future::pending().await
        }
    }

    fn request_line(arg: &str) -> String {
        let mut line = codec::encode(&Request::positional([Value::from(arg)])).unwrap();
        line.push('\n');
        line
    }

    async fn run_with_input(
        input: &[u8],
        executor: &(dyn Executor),
        diagnostics: &DiagnosticLog,
    ) -> (Result<(), ServerError>, Vec<String>) {
        let (mut client, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_out) = tokio::io::duplex(64 * 1024);
        client.write_all(input).await.unwrap();
        drop(client);

        let result = serve(
            server_in,
            server_out,
            executor,
            &ServerConfig::new(),
            diagnostics,
        )
        .await;

        let mut lines = Vec::new();
        let mut reader = BufReader::new(client_out).lines();
        while let Some(line) = reader.next_line().await.unwrap() {
            lines.push(line);
        }
        (result, lines)
    }

    #[tokio::test]
    async fn serves_requests_in_order() {
        let executor = EchoExecutor::default();
        let input = [request_line("a"), request_line("b"), request_line("c")].concat();

        let (result, lines) =
            run_with_input(input.as_bytes(), &executor, &DiagnosticLog::disabled()).await;

        result.unwrap();
        let responses: Vec<Response> = lines.iter().map(|l| codec::decode(l).unwrap()).collect();
        let outputs: Vec<_> = responses.iter().map(|r| (r.pid, r.stdout.clone())).collect();
        assert_eq!(
            outputs,
            [(100, b"a".to_vec()), (101, b"b".to_vec()), (102, b"c".to_vec())]
        );
    }

    #[tokio::test]
    async fn clean_eof_without_requests() {
        let executor = EchoExecutor::default();
        let (result, lines) = run_with_input(b"", &executor, &DiagnosticLog::disabled()).await;

        result.unwrap();
        assert!(lines.is_empty());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_line_stops_before_executing() {
        let executor = EchoExecutor::default();
        let input = format!("not a frame\n{}", request_line("never"));

        let (result, lines) =
            run_with_input(input.as_bytes(), &executor, &DiagnosticLog::disabled()).await;

        assert!(matches!(result, Err(ServerError::Decode(_))), "got {result:?}");
        assert!(lines.is_empty());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn answers_earlier_requests_before_failing() {
        let executor = EchoExecutor::default();
        let input = format!("{}v1 2 {{}}\n", request_line("first"));

        let (result, lines) =
            run_with_input(input.as_bytes(), &executor, &DiagnosticLog::disabled()).await;

        // `{}` lacks the required fields of a request.
        assert!(matches!(result, Err(ServerError::Decode(_))), "got {result:?}");
        assert_eq!(lines.len(), 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn executor_error_ends_loop() {
        let (result, lines) = run_with_input(
            request_line("x").as_bytes(),
            &FailingExecutor,
            &DiagnosticLog::disabled(),
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(
            err.to_string(),
            "execution failed: invalid arguments: 'cmd' must name a program"
        );
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn truncated_request_is_channel_error() {
        let executor = EchoExecutor::default();
        let line = request_line("cut");
        let partial = &line.as_bytes()[..line.len() / 2];

        let (result, _) = run_with_input(partial, &executor, &DiagnosticLog::disabled()).await;

        assert!(
            matches!(result, Err(ServerError::Channel(FrameError::Truncated))),
            "got {result:?}"
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn works_through_arc_executor() {
        let executor: Arc<dyn Executor> = Arc::new(EchoExecutor::default());
        let (result, lines) = run_with_input(
            request_line("shared").as_bytes(),
            &executor,
            &DiagnosticLog::disabled(),
        )
        .await;

        result.unwrap();
        assert_eq!(lines.len(), 1);
    }

    #[tokio::test]
    async fn diagnostics_record_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.log");
        let diagnostics = DiagnosticLog::open(&DiagnosticsConfig::enabled_at(&path)).unwrap();
        let executor = EchoExecutor::default();

        let (result, _) =
            run_with_input(request_line("hi").as_bytes(), &executor, &diagnostics).await;
        result.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        insta::assert_snapshot!(contents.trim_end(), @r#"
        Starting
        stdin: v1 35 {"args":[{"str":"hi"}],"kwargs":{}}
        result: pid=100 status=0 stdout="hi" stderr=""
        stdout: v1 50 {"pid":100,"status":0,"stdout":"aGk=","stderr":""}
        Exiting
        "#);
    }

    #[tokio::test]
    async fn diagnostics_record_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.log");
        let diagnostics = DiagnosticLog::open(&DiagnosticsConfig::enabled_at(&path)).unwrap();
        let executor = EchoExecutor::default();

        let (result, _) = run_with_input(b"v2 2 {}\n", &executor, &diagnostics).await;
        assert!(result.is_err());

        let contents = std::fs::read_to_string(&path).unwrap();
        insta::assert_snapshot!(contents.trim_end(), @r"
        Starting
        stdin: v2 2 {}
        error: bad request: unsupported protocol version tag 'v2'
        Exiting
        ");
    }

    #[tokio::test]
    async fn shutdown_drops_request_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.log");
        let diagnostics = DiagnosticLog::open(&DiagnosticsConfig::enabled_at(&path)).unwrap();
        let executor = HangingExecutor::default();

        let (mut client, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, _client_out) = tokio::io::duplex(64 * 1024);
        client.write_all(request_line("stuck").as_bytes()).await.unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let config = ServerConfig::new();
        let server = serve_until(server_in, server_out, &executor, &config, &diagnostics, async {
            let _ = stop_rx.await;
        });
        let stopper = async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let _ = stop_tx.send(());
        };
        let (result, ()) = tokio::join!(server, stopper);

        result.unwrap();
        assert_eq!(executor.dropped.load(Ordering::SeqCst), 1);
        let contents = std::fs::read_to_string(&path).unwrap();
        insta::assert_snapshot!(contents.trim_end(), @r#"
        Starting
        stdin: v1 38 {"args":[{"str":"stuck"}],"kwargs":{}}
        Interrupted
        "#);
    }
}
