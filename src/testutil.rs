//! In-process upstream HTTP server for exercising the download paths
//! in tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hashbrown::HashMap;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};

type FileTable = Arc<parking_lot::Mutex<HashMap<String, (StatusCode, Vec<u8>)>>>;
type HitTable = Arc<parking_lot::Mutex<HashMap<String, usize>>>;

pub(crate) struct Upstream {
    pub(crate) addr: SocketAddr,
    hits: HitTable,
    files: FileTable,
    pub(crate) delay: Arc<parking_lot::Mutex<Duration>>,
}

impl Upstream {
    pub(crate) fn put(&self, path: &str, data: &[u8]) {
        self.files
            .lock()
            .insert(path.to_string(), (StatusCode::OK, data.to_vec()));
    }

    pub(crate) fn remove(&self, path: &str) {
        self.files.lock().remove(path);
    }

    pub(crate) fn total_hits(&self) -> usize {
        self.hits.lock().values().sum()
    }

    pub(crate) fn hits_for(&self, path: &str) -> usize {
        self.hits.lock().get(path).copied().unwrap_or(0)
    }
}

/// Serves the registered files on an ephemeral localhost port,
/// counting requests per path. Unknown paths answer 404.
pub(crate) async fn spawn_upstream() -> Upstream {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let hits: HitTable = Arc::new(parking_lot::Mutex::new(HashMap::new()));
    let files: FileTable = Arc::new(parking_lot::Mutex::new(HashMap::new()));
    let delay = Arc::new(parking_lot::Mutex::new(Duration::ZERO));

    let task_hits = hits.clone();
    let task_files = files.clone();
    let task_delay = delay.clone();

    tokio::task::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };

            let hits = task_hits.clone();
            let files = task_files.clone();
            let delay = task_delay.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let hits = hits.clone();
                    let files = files.clone();
                    let delay = delay.clone();

                    async move {
                        let path = req.uri().path().trim_start_matches('/').to_string();
                        *hits.lock().entry_ref(path.as_str()).or_insert(0) += 1;

                        let pause = *delay.lock();
                        if !pause.is_zero() {
                            tokio::time::sleep(pause).await;
                        }

                        let entry = files.lock().get(&path).cloned();
                        let response = match entry {
                            Some((status, data)) => Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from(data)))
                                .unwrap(),
                            None => Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Full::new(Bytes::new()))
                                .unwrap(),
                        };

                        Ok::<_, std::convert::Infallible>(response)
                    }
                });

                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(hyper_util::rt::TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Upstream {
        addr,
        hits,
        files,
        delay,
    }
}
