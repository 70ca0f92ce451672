//! The terminal-session consumer of the core engine: what an SSH front end
//! calls once a user is authenticated. Generic over the byte stream so any
//! transport (or a test harness) can drive it.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::banner::border_message;
use super::menu;
use crate::core::{Container, ImageKind, ImageRegistry, SessionState, SessionStatus, User};
use crate::runtime::AttachedIo;
use crate::shutdown::{ShutdownController, ShutdownPhase};

/// How many times a handler re-requests a ContainerUser before giving up.
const MAX_RESTARTS: u32 = 5;
/// Grace period for the exit status to arrive after the stream ends cleanly.
const EXIT_STATUS_GRACE: Duration = Duration::from_secs(1);

/// Exit code for inactivity and session-length kicks.
pub const EXIT_CODE_TIMEOUT: i32 = 254;
/// Exit code for every other gateway-side failure.
pub const EXIT_CODE_ERROR: i32 = 255;

#[derive(Clone)]
pub struct SessionEnv {
    pub images: Arc<ImageRegistry>,
    pub shutdown: ShutdownController,
}

enum SessionEnd {
    Status(SessionStatus),
    Io(std::io::Result<()>),
}

/// Runs a full terminal session: menu, container acquisition, byte pumping,
/// and exit-code mapping. Resize events arrive on `resize_rx` as
/// (height, width) pairs. Returns the session's exit code.
pub async fn run_terminal_session<IO>(
    env: &SessionEnv,
    user: Arc<User>,
    io: IO,
    resize_rx: mpsc::Receiver<(u16, u16)>,
) -> i32
where
    IO: AsyncRead + AsyncWrite + Send,
{
    let (mut reader, mut writer) = tokio::io::split(io);

    let visible = env.images.get_images(ImageKind::Ssh, &user);
    let image = match menu::select_image(&mut reader, &mut writer, &visible).await {
        Ok(Some(image)) => image,
        Ok(None) => return EXIT_CODE_ERROR,
        Err(err) => {
            debug!("menu failed for {}: {err}", user);
            return EXIT_CODE_ERROR;
        }
    };

    let mut session = None;
    let mut last_status = None;
    for attempt in 1..=MAX_RESTARTS {
        let cu = image.container_user_for(&user);
        cu.activity();
        let (container, status) = cu.get_container().await;
        match container {
            Some(container) if status.state == SessionState::Working => {
                session = Some((cu, container));
                break;
            }
            _ => {
                warn!(
                    "failed to get working container for {}: {status}; retrying {attempt}/{MAX_RESTARTS}",
                    user
                );
                last_status = Some(status);
            }
        }
    }
    let Some((cu, container)) = session else {
        let status = last_status.unwrap_or(SessionStatus {
            state: SessionState::Dead,
            exit_code: 0,
            message: None,
        });
        return render_exit(env, &mut writer, &status).await;
    };

    let attached = match container.attach().await {
        Ok(attached) => attached,
        Err(err) => {
            warn!("attach to {} failed: {err}", container);
            let _ = writer
                .write_all(
                    border_message(&["Internal server error,", "sorry for the inconvenience"])
                        .as_bytes(),
                )
                .await;
            cu.notify_connection_closed().await;
            return EXIT_CODE_ERROR;
        }
    };

    let resize_task = spawn_resize_forwarder(container.clone(), resize_rx, &env.shutdown);

    let end = {
        let activity = cu.activity_sender();
        let pump = pump_bytes(&mut reader, &mut writer, attached, activity);
        tokio::pin!(pump);
        tokio::select! {
            status = cu.shutdown_done() => SessionEnd::Status(status),
            result = &mut pump => SessionEnd::Io(result),
        }
    };
    resize_task.abort();

    let code = match end {
        SessionEnd::Status(status) => render_exit(env, &mut writer, &status).await,
        SessionEnd::Io(Ok(())) => {
            // The stream ended cleanly; the container's exit status usually
            // arrives a beat later and carries the real code.
            match tokio::time::timeout(EXIT_STATUS_GRACE, cu.shutdown_done()).await {
                Ok(status) => render_exit(env, &mut writer, &status).await,
                Err(_) => EXIT_CODE_ERROR,
            }
        }
        SessionEnd::Io(Err(err)) => {
            debug!("session io for {} ended: {err}", user);
            render_exit(
                env,
                &mut writer,
                &SessionStatus {
                    state: SessionState::Dead,
                    exit_code: 0,
                    message: Some(err.to_string()),
                },
            )
            .await
        }
    };
    cu.notify_connection_closed().await;
    code
}

fn spawn_resize_forwarder(
    container: Arc<Container>,
    mut resize_rx: mpsc::Receiver<(u16, u16)>,
    shutdown: &ShutdownController,
) -> tokio::task::JoinHandle<()> {
    let token = shutdown.shutdown_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                resize = resize_rx.recv() => match resize {
                    Some((height, width)) => {
                        let _ = container.resize_tty(height, width).await;
                    }
                    None => break,
                },
                _ = token.cancelled() => break,
            }
        }
    })
}

/// Maps a terminal status to banner + exit code per the session contract.
async fn render_exit<W>(env: &SessionEnv, writer: &mut W, status: &SessionStatus) -> i32
where
    W: AsyncWrite + Unpin,
{
    if env.shutdown.phase() >= ShutdownPhase::Demanded {
        let _ = writer
            .write_all(
                border_message(&["Server is shutting down,", "sorry for the inconvenience"])
                    .as_bytes(),
            )
            .await;
        let _ = writer.flush().await;
        return EXIT_CODE_ERROR;
    }

    let (banner, code) = match status.state {
        SessionState::Shutdown => (None, status.exit_code as i32),
        SessionState::ShutdownWithErrMsg => (
            Some(border_message(&[status.message.as_deref().unwrap_or("container error")])),
            status.exit_code as i32,
        ),
        SessionState::ShutdownInactivity => (
            Some(border_message(&["Kicked out due to inactivity"])),
            EXIT_CODE_TIMEOUT,
        ),
        SessionState::ShutdownSessionLen => (
            Some(border_message(&["Kicked out due to session age"])),
            EXIT_CODE_TIMEOUT,
        ),
        _ => (
            Some(border_message(&["Internal server error,", "sorry for the inconvenience"])),
            EXIT_CODE_ERROR,
        ),
    };
    if let Some(banner) = banner {
        let _ = writer.write_all(banner.as_bytes()).await;
        let _ = writer.flush().await;
    }
    code
}

async fn pump_bytes<R, W>(
    client_reader: &mut R,
    client_writer: &mut W,
    attached: AttachedIo,
    activity: mpsc::Sender<()>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let AttachedIo {
        writer: mut container_writer,
        reader: mut container_reader,
    } = attached;
    let to_container = copy_with_activity(client_reader, &mut container_writer, activity.clone());
    let to_client = copy_with_activity(&mut container_reader, client_writer, activity);
    tokio::select! {
        result = to_container => result,
        result = to_client => result,
    }
}

/// Copies until EOF, marking activity for every chunk that flows.
async fn copy_with_activity<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: mpsc::Sender<()>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2048];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let _ = activity.try_send(());
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_state_with;
    use crate::runtime::testing::{labeled_image, MockRuntime};
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    async fn env_with(labels: &[(&str, &str)]) -> (MockRuntime, SessionEnv) {
        let mock = MockRuntime::default();
        mock.set_images(vec![labeled_image("sha256:img", &[], labels)]);
        let state = test_state_with(Arc::new(mock.clone()));
        let images = Arc::new(ImageRegistry::new(state.clone()));
        images.reconcile().await.unwrap();
        let shutdown = state.shutdown.clone();
        (mock, SessionEnv { images, shutdown })
    }

    fn collect_output(
        mut reader: tokio::io::ReadHalf<DuplexStream>,
    ) -> Arc<Mutex<Vec<u8>>> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().unwrap().extend_from_slice(&buf[..n]),
                }
            }
        });
        collected
    }

    async fn wait_for_peer(mock: &MockRuntime, id: &str) -> DuplexStream {
        for _ in 0..200 {
            if let Some(peer) = mock.take_peer(id) {
                return peer;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("container {id} never attached");
    }

    #[tokio::test(start_paused = true)]
    async fn clean_exit_propagates_the_container_code() {
        let (mock, env) = env_with(&[("orca.kind", "ssh"), ("orca.name", "maze")]).await;
        let user = crate::core::UserRegistry::new("http://unused.invalid").user_from_ssh("alice");

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_r, mut client_w) = tokio::io::split(client);
        let output = collect_output(client_r);
        let (resize_tx, resize_rx) = mpsc::channel(4);

        let handler = tokio::spawn({
            let env = env.clone();
            async move { run_terminal_session(&env, user, server, resize_rx).await }
        });

        client_w.write_all(b"maze\r").await.unwrap();
        let mut peer = wait_for_peer(&mock, "ctr-1").await;

        // Bytes flow both ways through the attach bridge.
        client_w.write_all(b"whoami\r").await.unwrap();
        let mut buf = [0u8; 64];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"whoami\r");
        peer.write_all(b"root\r\n").await.unwrap();

        // Resize events reach the runtime.
        resize_tx.send((50, 120)).await.unwrap();
        for _ in 0..100 {
            if !mock.resizes().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(mock.resizes(), vec![("ctr-1".to_string(), 50, 120)]);

        mock.exit("ctr-1", 0, None);
        assert_eq!(handler.await.unwrap(), 0);

        let text = String::from_utf8_lossy(&output.lock().unwrap().clone()).into_owned();
        assert!(text.contains("root"));

        // total=1 by default for ssh: the container leaves right after.
        for _ in 0..100 {
            if mock.is_removed("ctr-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(mock.is_removed("ctr-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_kick_banners_and_exits_254() {
        let (mock, env) = env_with(&[
            ("orca.kind", "ssh"),
            ("orca.name", "maze"),
            ("orca.timeout.inactive", "5m"),
        ])
        .await;
        let user = crate::core::UserRegistry::new("http://unused.invalid").user_from_ssh("alice");

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_r, mut client_w) = tokio::io::split(client);
        let output = collect_output(client_r);
        let (_resize_tx, resize_rx) = mpsc::channel(4);

        let handler = tokio::spawn({
            let env = env.clone();
            async move { run_terminal_session(&env, user, server, resize_rx).await }
        });

        client_w.write_all(b"maze\r").await.unwrap();
        let _peer = wait_for_peer(&mock, "ctr-1").await;

        tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
        assert_eq!(handler.await.unwrap(), EXIT_CODE_TIMEOUT);

        let text = String::from_utf8_lossy(&output.lock().unwrap().clone()).into_owned();
        assert!(text.contains("Kicked out due to inactivity"));
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_banners_and_exits_255() {
        let (mock, env) = env_with(&[("orca.kind", "ssh"), ("orca.name", "maze")]).await;
        mock.fail_next_creates(1000);
        let user = crate::core::UserRegistry::new("http://unused.invalid").user_from_ssh("alice");

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_r, mut client_w) = tokio::io::split(client);
        let output = collect_output(client_r);
        let (_resize_tx, resize_rx) = mpsc::channel(4);

        let handler = tokio::spawn({
            let env = env.clone();
            async move { run_terminal_session(&env, user, server, resize_rx).await }
        });
        client_w.write_all(b"maze\r").await.unwrap();

        assert_eq!(handler.await.unwrap(), EXIT_CODE_ERROR);
        let text = String::from_utf8_lossy(&output.lock().unwrap().clone()).into_owned();
        assert!(text.contains("Internal server error,"));
    }

    #[tokio::test(start_paused = true)]
    async fn demanded_shutdown_banners_and_exits_255() {
        let (mock, env) = env_with(&[("orca.kind", "ssh"), ("orca.name", "maze")]).await;
        let user = crate::core::UserRegistry::new("http://unused.invalid").user_from_ssh("alice");

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_r, mut client_w) = tokio::io::split(client);
        let output = collect_output(client_r);
        let (_resize_tx, resize_rx) = mpsc::channel(4);

        let handler = tokio::spawn({
            let env = env.clone();
            async move { run_terminal_session(&env, user, server, resize_rx).await }
        });
        client_w.write_all(b"maze\r").await.unwrap();
        let _peer = wait_for_peer(&mock, "ctr-1").await;

        env.shutdown.demand();
        assert_eq!(handler.await.unwrap(), EXIT_CODE_ERROR);
        let text = String::from_utf8_lossy(&output.lock().unwrap().clone()).into_owned();
        assert!(text.contains("Server is shutting down,"));

        env.shutdown.done().await;
        assert!(mock.is_removed("ctr-1"));
    }
}
