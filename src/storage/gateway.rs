// cloudstash/src/storage/gateway.rs
//! Storage gateway: the single boundary between callers and the object
//! client.
//!
//! The client is built and driven on a dedicated OS thread that runs its own
//! tokio runtime; neither construction (trust roots, profile files) nor any
//! request runs on the caller's executor. Callers hand work over through a
//! channel and await a one-shot reply.

use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::thread;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::client::{
    ClientFactory, CompletedPart, ObjectBody, ObjectClient, ObjectInfo, ObjectPage, OpenUpload,
};
use super::{ClientError, ClientResult};

/// Chunks buffered between the worker and a reader of a streamed GET.
const BODY_CHANNEL_DEPTH: usize = 8;

type Job = Box<dyn FnOnce(Arc<dyn ObjectClient>) -> BoxFuture<'static, ()> + Send>;

enum Command {
    Run(Job),
    Shutdown(oneshot::Sender<ClientResult<()>>),
}

enum BodyFrame {
    Chunk(Bytes),
    Failed(ClientError),
    End,
}

struct Worker {
    commands: mpsc::UnboundedSender<Command>,
    thread: thread::JoinHandle<()>,
}

pub struct StorageGateway {
    name: String,
    factory: Arc<dyn ClientFactory>,
    worker: Mutex<Option<Worker>>,
}

impl StorageGateway {
    pub fn new(name: impl Into<String>, factory: Arc<dyn ClientFactory>) -> Self {
        StorageGateway {
            name: name.into(),
            factory,
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    /// Start the worker, build the client on it and verify the bucket.
    ///
    /// Returns once the worker has signalled readiness (or failure); the first
    /// `submit` is never observed before that. Calling it on a running gateway
    /// fails with [`ClientError::AlreadyRunning`].
    pub async fn launch(&self) -> ClientResult<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(ClientError::AlreadyRunning);
        }

        let (commands, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let factory = Arc::clone(&self.factory);
        let thread_name = format!("{}-storage", self.name);
        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_worker(thread_name, factory, receiver, ready_tx))
            .map_err(|e| ClientError::Worker(format!("failed to spawn storage thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(gateway = %self.name, "storage gateway ready");
                *worker = Some(Worker { commands, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                join_worker(thread).await;
                Err(e)
            }
            Err(_) => {
                join_worker(thread).await;
                Err(ClientError::Worker(
                    "storage thread exited before signalling readiness".to_string(),
                ))
            }
        }
    }

    /// Run `operation` against the client on the worker and wait for its result.
    ///
    /// Each submission runs as its own task on the worker, so concurrent
    /// callers are not serialized by the gateway.
    pub async fn submit<T, F, Fut>(&self, operation: F) -> ClientResult<T>
    where
        F: FnOnce(Arc<dyn ObjectClient>) -> Fut + Send + 'static,
        Fut: Future<Output = ClientResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let commands = match self.worker.lock().await.as_ref() {
            Some(worker) => worker.commands.clone(),
            None => return Err(ClientError::NotRunning),
        };

        let (reply, response) = oneshot::channel();
        let job: Job = Box::new(move |client: Arc<dyn ObjectClient>| {
            async move {
                // The caller may have stopped waiting.
                let _ = reply.send(operation(client).await);
            }
            .boxed()
        });
        commands
            .send(Command::Run(job))
            .map_err(|_| ClientError::NotRunning)?;

        response.await.map_err(|_| {
            ClientError::Worker("operation was dropped before it completed".to_string())
        })?
    }

    /// Stop accepting work, finish everything already submitted, close the
    /// client and join the worker thread. A no-op when not running.
    pub async fn shutdown(&self) -> ClientResult<()> {
        let Some(worker) = self.worker.lock().await.take() else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let closed = if worker.commands.send(Command::Shutdown(ack_tx)).is_ok() {
            ack_rx.await.unwrap_or(Ok(()))
        } else {
            Ok(())
        };
        drop(worker.commands);
        join_worker(worker.thread).await;

        info!(gateway = %self.name, "storage gateway stopped");
        closed
    }

    pub async fn head_bucket(&self) -> ClientResult<()> {
        self.submit(|client| async move { client.head_bucket().await })
            .await
    }

    pub async fn put_object(&self, key: &str, body: Bytes) -> ClientResult<()> {
        let key = key.to_string();
        self.submit(move |client| async move { client.put_object(&key, body).await })
            .await
    }

    /// Stream an object. Chunks are pumped by a worker task into a bounded
    /// channel; a stream cut short by shutdown ends with an error rather than
    /// silently truncating.
    pub async fn get_object(&self, key: &str) -> ClientResult<ObjectBody> {
        let key = key.to_string();
        let frames = self
            .submit(move |client| async move {
                let mut body = client.get_object(&key).await?;
                let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
                tokio::spawn(async move {
                    loop {
                        let frame = match body.next().await {
                            Some(Ok(chunk)) => BodyFrame::Chunk(chunk),
                            Some(Err(e)) => BodyFrame::Failed(e),
                            None => BodyFrame::End,
                        };
                        let last = !matches!(frame, BodyFrame::Chunk(_));
                        if tx.send(frame).await.is_err() || last {
                            break;
                        }
                    }
                });
                Ok(rx)
            })
            .await?;

        Ok(Box::pin(futures::stream::unfold(
            Some(frames),
            |state| async move {
                let mut frames = state?;
                match frames.recv().await {
                    Some(BodyFrame::Chunk(chunk)) => Some((Ok(chunk), Some(frames))),
                    Some(BodyFrame::Failed(e)) => Some((Err(e), None)),
                    Some(BodyFrame::End) => None,
                    None => Some((Err(ClientError::NotRunning), None)),
                }
            },
        )))
    }

    /// GET an object and collect it into memory.
    pub async fn get_object_bytes(&self, key: &str) -> ClientResult<Bytes> {
        let mut body = self.get_object(key).await?;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    pub async fn head_object(&self, key: &str) -> ClientResult<Option<ObjectInfo>> {
        let key = key.to_string();
        self.submit(move |client| async move { client.head_object(&key).await })
            .await
    }

    pub async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> ClientResult<ObjectPage> {
        let prefix = prefix.to_string();
        self.submit(move |client| async move {
            client.list_objects(&prefix, continuation_token).await
        })
        .await
    }

    pub async fn delete_object(&self, key: &str) -> ClientResult<()> {
        let key = key.to_string();
        self.submit(move |client| async move { client.delete_object(&key).await })
            .await
    }

    pub async fn create_multipart_upload(&self, key: &str) -> ClientResult<String> {
        let key = key.to_string();
        self.submit(move |client| async move { client.create_multipart_upload(&key).await })
            .await
    }

    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> ClientResult<CompletedPart> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        self.submit(move |client| async move {
            client.upload_part(&key, &upload_id, part_number, body).await
        })
        .await
    }

    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ClientResult<()> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        self.submit(move |client| async move {
            client
                .complete_multipart_upload(&key, &upload_id, parts)
                .await
        })
        .await
    }

    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> ClientResult<()> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        self.submit(move |client| async move {
            client.abort_multipart_upload(&key, &upload_id).await
        })
        .await
    }

    pub async fn list_multipart_uploads(&self, prefix: &str) -> ClientResult<Vec<OpenUpload>> {
        let prefix = prefix.to_string();
        self.submit(move |client| async move { client.list_multipart_uploads(&prefix).await })
            .await
    }
}

/// Body of the storage thread.
fn run_worker(
    name: String,
    factory: Arc<dyn ClientFactory>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<ClientResult<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .thread_name(name.clone())
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(ClientError::Worker(format!(
                "failed to build storage runtime: {}",
                e
            ))));
            return;
        }
    };

    runtime.block_on(async move {
        let client = match factory.connect().await {
            Ok(client) => client,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        if let Err(e) = client.head_bucket().await {
            let _ = client.close().await;
            let _ = ready.send(Err(e));
            return;
        }
        if ready.send(Ok(())).is_err() {
            // Launcher went away; nobody can submit.
            let _ = client.close().await;
            return;
        }
        debug!(worker = %name, "storage worker accepting operations");

        let mut in_flight = JoinSet::new();
        let ack = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Run(job)) => {
                        in_flight.spawn(job(Arc::clone(&client)));
                    }
                    Some(Command::Shutdown(ack)) => break Some(ack),
                    None => break None,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(worker = %name, error = %e, "storage task failed");
                    }
                }
            }
        };

        // Anything queued before the shutdown request still runs.
        commands.close();
        while let Some(command) = commands.recv().await {
            match command {
                Command::Run(job) => {
                    in_flight.spawn(job(Arc::clone(&client)));
                }
                Command::Shutdown(other) => {
                    let _ = other.send(Ok(()));
                }
            }
        }
        let pending = in_flight.len();
        if pending > 0 {
            debug!(worker = %name, pending, "waiting for in-flight operations");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!(worker = %name, error = %e, "storage task failed");
            }
        }

        let closed = client.close().await;
        if let Some(ack) = ack {
            let _ = ack.send(closed);
        }
    });
}

async fn join_worker(thread: thread::JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => warn!("storage thread panicked"),
        Err(e) => warn!(error = %e, "failed to join storage thread"),
    }
}
