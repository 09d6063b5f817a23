//! In-process WebDAV server for tests.
//!
//! `dav-server` over a temp directory, served with hyper on `127.0.0.1:0`
//! under the `/dav` prefix so href-to-path mapping is exercised.

use dav_server::{fakels::FakeLs, localfs::LocalFs, DavHandler};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub struct TestDavServer {
    addr: SocketAddr,
    root: tempfile::TempDir,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestDavServer {
    pub async fn start() -> Self {
        let root = tempfile::tempdir().unwrap();
        let dav_server = DavHandler::builder()
            .strip_prefix("/dav")
            .filesystem(LocalFs::new(root.path(), false, false, false))
            .locksystem(FakeLs::new())
            .build_handler();

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { continue };
                        let dav_server = dav_server.clone();
                        tokio::spawn(async move {
                            let _ = http1::Builder::new()
                                .serve_connection(
                                    TokioIo::new(stream),
                                    service_fn(move |req| {
                                        let dav_server = dav_server.clone();
                                        async move { Ok::<_, Infallible>(dav_server.handle(req).await) }
                                    }),
                                )
                                .await;
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            root,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Base URL of the WebDAV root, with trailing slash
    pub fn url(&self) -> String {
        format!("http://{}/dav/", self.addr)
    }

    /// Directory the server exposes
    pub fn root(&self) -> &Path {
        self.root.path()
    }
}

impl Drop for TestDavServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
