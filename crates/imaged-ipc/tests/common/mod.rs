//! In-process workers for channel and supervisor tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use imaged_core::config::TtlConfig;
use imaged_core::types::names;
use imaged_core::{Command, Reply, Response};
use imaged_crypto::{ttl, MasterKey, WorkerIdentity};
use imaged_ipc::{
    serve, CommandHandler, ImagedClient, Launcher, RetryPolicy, Supervisor, SupervisorOptions,
    WorkerHandle, WorkerLink,
};
use imaged_core::ImagedResult;
use serde_json::{json, Value};
use tokio::io::BufReader;

pub const TEST_MASTER_KEY: [u8; 32] = [7u8; 32];

pub fn identity() -> &'static WorkerIdentity {
    static IDENTITY: OnceLock<WorkerIdentity> = OnceLock::new();
    IDENTITY.get_or_init(|| WorkerIdentity::generate(1024).unwrap())
}

/// Small command set:
/// - `ECHO` returns its parameters
/// - `BLOB {size}` streams `size` bytes of 0xAB
/// - `SLOW {ms}` sleeps before answering
/// - `CRASH` kills the worker
/// - `CONVERT_TO_TTL` / `OPEN_TTL` use [`TEST_MASTER_KEY`]
#[derive(Clone, Default)]
pub struct TestHandler {
    /// Answer OPEN_TTL with an inline base64 string instead of a payload frame
    pub inline_open: bool,
    /// `id` parameter and arrival time of every command, in arrival order
    pub receipts: Arc<Mutex<Vec<(Value, Instant)>>>,
}

impl TestHandler {
    pub fn receipts(&self) -> Vec<(Value, Instant)> {
        self.receipts.lock().unwrap().clone()
    }
}

impl CommandHandler for TestHandler {
    async fn handle(&self, command: Command) -> Reply {
        let id = command.param("id").cloned().unwrap_or(Value::Null);
        self.receipts.lock().unwrap().push((id, Instant::now()));
        match command.name() {
            "ECHO" => Response::ok(Value::Object(command.parameters().clone())).into(),
            "BLOB" => {
                let size = command.param("size").and_then(Value::as_u64).unwrap_or(0) as usize;
                Reply::Streamed {
                    metadata: Response::ok(json!({ "size": size })),
                    payload: vec![0xAB; size],
                }
            }
            "SLOW" => {
                let ms = command.param("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Response::ok("slow done").into()
            }
            "CRASH" => panic!("worker crashed on request"),
            names::CONVERT_TO_TTL => convert(&command).into(),
            names::OPEN_TTL => self.open(&command),
            other => Response::failure(format!("Unknown command: {other}")).into(),
        }
    }
}

fn param_str<'a>(command: &'a Command, key: &str) -> &'a str {
    command.param(key).and_then(Value::as_str).unwrap_or_default()
}

fn convert(command: &Command) -> Response {
    let input = std::path::Path::new(param_str(command, "input_path"));
    let expiry = command.param("expiry_ts").and_then(Value::as_i64).unwrap_or(0);
    let output = input.with_extension("ttl");
    let result = std::fs::read(input)
        .map_err(|e| e.to_string())
        .and_then(|image| {
            ttl::encode(expiry, &image, &MasterKey::from_bytes(TEST_MASTER_KEY))
                .map_err(|e| e.to_string())
        })
        .and_then(|container| std::fs::write(&output, container).map_err(|e| e.to_string()));
    match result {
        Ok(()) => Response::ok(output.to_string_lossy().into_owned()),
        Err(e) => Response::failure(e),
    }
}

impl TestHandler {
    fn open(&self, command: &Command) -> Reply {
        let decoded = std::fs::read(param_str(command, "input_path"))
            .map_err(|e| e.to_string())
            .and_then(|container| {
                ttl::decode(&container, &MasterKey::from_bytes(TEST_MASTER_KEY))
                    .map_err(|e| e.to_string())
            });
        match decoded {
            Ok(contents) if self.inline_open => {
                use base64::Engine;
                Response::ok(base64::engine::general_purpose::STANDARD.encode(contents.payload))
                    .into()
            }
            Ok(contents) => Reply::Streamed {
                metadata: Response::ok(json!({ "expiry": contents.expiry })),
                payload: contents.payload,
            },
            Err(e) => Response::failure(e).into(),
        }
    }
}

/// Launches [`TestHandler`] workers on in-memory pipes.
#[derive(Clone, Default)]
pub struct TestLauncher {
    pub launches: Arc<AtomicUsize>,
    /// This many launches produce a worker that never speaks
    pub silent_first: usize,
    pub handler: TestHandler,
}

impl TestLauncher {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Launcher for TestLauncher {
    async fn launch(&self) -> ImagedResult<WorkerLink> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        let (front_out, worker_in) = tokio::io::duplex(64 * 1024);
        let (worker_out, front_in) = tokio::io::duplex(64 * 1024);

        let task = if n < self.silent_first {
            tokio::spawn(async move {
                let _streams = (worker_in, worker_out);
                std::future::pending::<()>().await;
            })
        } else {
            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(BufReader::new(worker_in), worker_out, identity(), &handler).await
                {
                    eprintln!("test worker stopped: {e}");
                }
            })
        };

        Ok(WorkerLink {
            reader: Box::new(BufReader::new(front_in)),
            writer: Box::new(front_out),
            handle: WorkerHandle::Task(task),
        })
    }
}

pub fn fast_options() -> SupervisorOptions {
    SupervisorOptions {
        handshake_timeout: Duration::from_millis(500),
        command_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        },
    }
}

pub fn supervisor(launcher: TestLauncher) -> Supervisor<TestLauncher> {
    Supervisor::new(launcher, fast_options())
}

pub fn client(launcher: TestLauncher) -> ImagedClient<TestLauncher> {
    ImagedClient::new(supervisor(launcher), &TtlConfig::default())
}
