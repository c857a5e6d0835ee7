use std::path::Path;
use std::time::Duration;

use hostpty_proto::deviceplugin::{Empty, RegisterRequest, RegistrationRequest, Reply, API_VERSION};
use hostpty_proto::{FrameReader, FrameWriter, ProtoError};
use hostpty_runtime::{dial_unix, DialError};

use crate::allocator::RESOURCE_NAME;

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("node agent did not answer within {0:?}")]
    Timeout(Duration),

    #[error("node agent rejected registration: {0}")]
    Rejected(String),
}

/// Announce this plugin to the node agent listening on `kubelet_socket`.
///
/// The agent is told the file name of `listen_socket`; it dials it back
/// relative to its device-plugin directory.
pub async fn register(
    kubelet_socket: &Path,
    listen_socket: &Path,
    timeout: Duration,
) -> Result<(), RegistrationError> {
    let endpoint = listen_socket
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    log::debug!(
        "start register resource {RESOURCE_NAME} (api {API_VERSION}, endpoint {endpoint})"
    );

    let stream = dial_unix(kubelet_socket, timeout).await?;
    let (read_half, write_half) = stream.into_split();
    let mut writer = FrameWriter::new(write_half);
    writer
        .send(&RegistrationRequest::Register(RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint,
            resource_name: RESOURCE_NAME.to_string(),
            options: None,
        }))
        .await?;

    let mut reader = FrameReader::new(read_half);
    let reply: Reply<Empty> = tokio::time::timeout(timeout, reader.expect())
        .await
        .map_err(|_| RegistrationError::Timeout(timeout))??;
    reply.into_result().map_err(|message| {
        log::error!("register resource failed: {message}");
        RegistrationError::Rejected(message)
    })?;
    log::info!("registered resource {RESOURCE_NAME}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    async fn fake_agent(path: &Path, reply: Reply<Empty>) -> tokio::task::JoinHandle<RegisterRequest> {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let request: RegistrationRequest = FrameReader::new(read_half).expect().await.unwrap();
            FrameWriter::new(write_half).send(&reply).await.unwrap();
            let RegistrationRequest::Register(request) = request;
            request
        })
    }

    #[tokio::test]
    async fn test_register_sends_endpoint_name() {
        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("kubelet.sock");
        let seen = fake_agent(&agent, Reply::ok(Empty {})).await;

        register(
            &agent,
            Path::new("/var/lib/kubelet/device-plugins/hostpty.sock"),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let request = seen.await.unwrap();
        assert_eq!(request.version, "v1beta1");
        assert_eq!(request.endpoint, "hostpty.sock");
        assert_eq!(request.resource_name, "hostpty.dev/pty");
    }

    #[tokio::test]
    async fn test_rejection_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("kubelet.sock");
        let _seen = fake_agent(&agent, Reply::error("version not supported")).await;

        let err = register(&agent, Path::new("hostpty.sock"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(
            matches!(err, RegistrationError::Rejected(ref m) if m == "version not supported"),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_missing_agent_is_dial_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = register(
            &dir.path().join("absent.sock"),
            Path::new("hostpty.sock"),
            Duration::from_millis(150),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RegistrationError::Dial(_)), "got {err:?}");
    }
}
