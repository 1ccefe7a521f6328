//! Request/reply gateway for the interactive test generator.
//!
//! Transport: one accepted TCP connection, strict request/reply alternation.
//! Every message is a JSON envelope `{"cmd": ..., "data": ...}` and must fit
//! in a 1024-byte read. Messages that do not fit travel as a
//! `readJsonFile` pointer to a spill file holding the real envelope; the
//! spill file is left in place for diagnosis.

use crate::timer::Deadline;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Hard ceiling of the transport's fixed-size reads.
pub const MESSAGE_LIMIT: usize = 1024;

/// Payload echoed back for unrecognized commands.
const UNKNOWN_ECHO: [u32; 3] = [4, 0, 4];

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Even the spill pointer exceeds the transport limit. The limit is a
    /// physical property of the transport, so this cannot be recovered.
    #[error("spill pointer message is {size} bytes, over the {MESSAGE_LIMIT}-byte limit")]
    PointerTooLarge { size: usize },
    /// Spill files are named per reply and must not be overwritten.
    #[error("spill file {0} already exists")]
    SpillExists(PathBuf),
    #[error("peer closed the connection mid-session")]
    ConnectionClosed,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The wire envelope every message uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub cmd: String,
    /// Absent payloads arrive as `Null` rather than failing the parse.
    #[serde(default)]
    pub data: Value,
}

/// A freshly generated suite announced over `getKillMatrixAndNewGoals`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSuite {
    pub generation: u32,
    /// Test method names within the suite class.
    pub tests: Vec<String>,
    pub classname: String,
    pub test_suite_path: PathBuf,
    pub test_scaffolding_path: PathBuf,
}

impl NewSuite {
    /// Root of the suite's source tree: the ancestor of the suite file above
    /// its package directories.
    pub fn dir_src(&self) -> Option<PathBuf> {
        let depth = self.classname.split('.').count();
        self.test_suite_path
            .ancestors()
            .nth(depth)
            .map(Path::to_path_buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRef {
    pub index: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillRecord {
    pub test_name: String,
    pub killed_patches: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixLocation {
    pub classname: String,
    pub target_lines: Vec<u32>,
}

/// Reply payload of `getKillMatrixAndNewGoals`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillMatrixReply {
    pub kill_matrix: Vec<KillRecord>,
    pub patches: Vec<PatchRef>,
    pub fix_locations: Vec<FixLocation>,
}

/// Closed set of wire commands. Anything else lands in `Unknown` and is
/// echoed back rather than terminating the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetPatchPool,
    GetKillMatrixAndNewGoals(NewSuite),
    CloseConnection,
    Unknown { cmd: String },
}

impl Command {
    pub fn parse(envelope: &Envelope) -> Result<Self, ProtocolError> {
        Ok(match envelope.cmd.as_str() {
            "getPatchPool" => Self::GetPatchPool,
            "getKillMatrixAndNewGoals" => {
                Self::GetKillMatrixAndNewGoals(serde_json::from_value(envelope.data.clone())?)
            }
            "closeConnection" => Self::CloseConnection,
            other => Self::Unknown {
                cmd: other.to_string(),
            },
        })
    }
}

/// Serialize a reply envelope, spilling to `dump_path` when it exceeds the
/// transport limit. Returns the bytes to put on the wire.
pub fn encode_reply(envelope: &Envelope, dump_path: &Path) -> Result<Vec<u8>, ProtocolError> {
    let raw = serde_json::to_vec(envelope)?;
    if raw.len() <= MESSAGE_LIMIT {
        return Ok(raw);
    }

    if dump_path.exists() {
        return Err(ProtocolError::SpillExists(dump_path.to_path_buf()));
    }
    std::fs::write(dump_path, &raw)?;
    tracing::debug!(
        "Reply of {} bytes spilled to {}",
        raw.len(),
        dump_path.display()
    );

    let pointer = Envelope {
        cmd: "readJsonFile".to_string(),
        data: serde_json::json!({ "path": dump_path }),
    };
    let pointer_raw = serde_json::to_vec(&pointer)?;
    if pointer_raw.len() > MESSAGE_LIMIT {
        return Err(ProtocolError::PointerTooLarge {
            size: pointer_raw.len(),
        });
    }
    Ok(pointer_raw)
}

/// Resolve an inbound `readJsonFile` indirection: the pointed-to file holds
/// the true envelope. The spill file is kept for diagnosis.
pub fn resolve_inbound(envelope: Envelope) -> Result<Envelope, ProtocolError> {
    if envelope.cmd != "readJsonFile" {
        return Ok(envelope);
    }
    #[derive(Deserialize)]
    struct Pointer {
        path: PathBuf,
    }
    let pointer: Pointer = serde_json::from_value(envelope.data)?;
    let raw = std::fs::read(&pointer.path)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// What the gateway needs from the orchestrator to answer requests.
#[async_trait]
pub trait GatewayHandler: Send {
    async fn patch_pool(&mut self) -> anyhow::Result<Vec<PatchRef>>;
    async fn kill_matrix_and_new_goals(
        &mut self,
        suite: NewSuite,
    ) -> anyhow::Result<KillMatrixReply>;
    /// Current test-generation iteration; used to name spill files.
    fn iteration(&self) -> u32;
    /// Called only after the round's reply went out successfully.
    fn advance_iteration(&mut self);
    fn dump_dir(&self) -> &Path;
}

/// Single-connection request/reply server on an ephemeral port.
pub struct Gateway {
    listener: TcpListener,
}

impl Gateway {
    pub async fn bind() -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        Ok(Self { listener })
    }

    /// Port to hand to the child process.
    pub fn port(&self) -> std::io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept one connection and serve it until `closeConnection` or the
    /// deadline. Strict alternation: one request, one reply, repeat.
    pub async fn serve<H: GatewayHandler>(
        &self,
        handler: &mut H,
        deadline: Deadline,
    ) -> anyhow::Result<()> {
        let (mut stream, peer) = self.listener.accept().await?;
        tracing::info!("Test generator connected from {}", peer);

        // Per-connection reply counter; keeps every spill file distinct.
        let mut replies: u64 = 0;
        loop {
            if deadline.expired() {
                tracing::warn!("Deadline elapsed, closing the gateway session");
                return Ok(());
            }
            let envelope = match read_envelope(&mut stream).await {
                Ok(envelope) => envelope,
                Err(ProtocolError::ConnectionClosed) => {
                    tracing::info!("Test generator hung up");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let envelope = resolve_inbound(envelope)?;

            match Command::parse(&envelope)? {
                Command::GetPatchPool => {
                    let patches = handler.patch_pool().await?;
                    let reply = Envelope {
                        cmd: "getPatchPool".to_string(),
                        data: serde_json::json!({ "patches": patches }),
                    };
                    self.send(handler, &mut stream, &reply, replies).await?;
                    replies += 1;
                }
                Command::GetKillMatrixAndNewGoals(suite) => {
                    tracing::info!(
                        "New suite {} with {} test(s) announced",
                        suite.classname,
                        suite.tests.len()
                    );
                    let result = handler.kill_matrix_and_new_goals(suite).await?;
                    let reply = Envelope {
                        cmd: "getKillMatrixAndNewGoals".to_string(),
                        data: serde_json::to_value(&result)?,
                    };
                    self.send(handler, &mut stream, &reply, replies).await?;
                    replies += 1;
                    handler.advance_iteration();
                }
                Command::Unknown { cmd } => {
                    tracing::warn!("Unknown command \"{}\", echoing it back", cmd);
                    let reply = Envelope {
                        cmd,
                        data: serde_json::json!(UNKNOWN_ECHO),
                    };
                    self.send(handler, &mut stream, &reply, replies).await?;
                    replies += 1;
                }
                Command::CloseConnection => {
                    tracing::info!("Session closed by the test generator");
                    return Ok(());
                }
            }
        }
    }

    async fn send<H: GatewayHandler>(
        &self,
        handler: &H,
        stream: &mut TcpStream,
        reply: &Envelope,
        serial: u64,
    ) -> Result<(), ProtocolError> {
        let dump_path = handler
            .dump_dir()
            .join(format!("reply_iter{}_{}.json", handler.iteration(), serial));
        let raw = encode_reply(reply, &dump_path)?;
        stream.write_all(&raw).await?;
        Ok(())
    }
}

async fn read_envelope(stream: &mut TcpStream) -> Result<Envelope, ProtocolError> {
    let mut buf = [0u8; MESSAGE_LIMIT];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    Ok(serde_json::from_slice(&buf[..n])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn envelope(cmd: &str, data: Value) -> Envelope {
        Envelope {
            cmd: cmd.to_string(),
            data,
        }
    }

    #[test]
    fn test_command_parse_closed_set() {
        assert_eq!(
            Command::parse(&envelope("getPatchPool", Value::Null)).unwrap(),
            Command::GetPatchPool
        );
        assert_eq!(
            Command::parse(&envelope("closeConnection", Value::Null)).unwrap(),
            Command::CloseConnection
        );
        assert_eq!(
            Command::parse(&envelope("frobnicate", Value::Null)).unwrap(),
            Command::Unknown {
                cmd: "frobnicate".to_string()
            }
        );
    }

    #[test]
    fn test_new_suite_wire_form() {
        let data = serde_json::json!({
            "generation": 3,
            "tests": ["t1", "t2"],
            "classname": "com.example.FooTest",
            "testSuitePath": "/runs/1/suites/com/example/FooTest.java",
            "testScaffoldingPath": "/runs/1/suites/com/example/FooTest_scaffolding.java",
        });
        let Command::GetKillMatrixAndNewGoals(suite) =
            Command::parse(&envelope("getKillMatrixAndNewGoals", data)).unwrap()
        else {
            panic!("expected a new-suite command");
        };
        assert_eq!(suite.generation, 3);
        assert_eq!(suite.classname, "com.example.FooTest");
        assert_eq!(suite.tests, vec!["t1", "t2"]);
        // The source root sits above the package directories.
        assert_eq!(suite.dir_src(), Some(PathBuf::from("/runs/1/suites")));
    }

    #[test]
    fn test_small_reply_is_sent_inline() {
        let temp = TempDir::new().unwrap();
        let dump = temp.path().join("reply.json");
        let reply = envelope("getPatchPool", serde_json::json!({"patches": []}));

        let raw = encode_reply(&reply, &dump).unwrap();

        assert!(raw.len() <= MESSAGE_LIMIT);
        assert!(!dump.exists());
        let parsed: Envelope = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed.cmd, "getPatchPool");
    }

    #[test]
    fn test_oversized_reply_round_trips_through_spill() {
        let temp = TempDir::new().unwrap();
        let dump = temp.path().join("reply.json");
        // Serializes to roughly 2000 bytes, well over the limit.
        let big = "x".repeat(2000);
        let reply = envelope("getKillMatrixAndNewGoals", serde_json::json!({ "blob": big }));

        let raw = encode_reply(&reply, &dump).unwrap();

        assert!(raw.len() <= MESSAGE_LIMIT);
        let pointer: Envelope = serde_json::from_slice(&raw).unwrap();
        assert_eq!(pointer.cmd, "readJsonFile");
        // The spill file holds the original envelope.
        let resolved = resolve_inbound(pointer).unwrap();
        assert_eq!(resolved.cmd, "getKillMatrixAndNewGoals");
        assert_eq!(resolved.data["blob"], reply.data["blob"]);
        // The spill file is left in place.
        assert!(dump.exists());
    }

    #[test]
    fn test_existing_spill_file_is_fatal() {
        let temp = TempDir::new().unwrap();
        let dump = temp.path().join("reply.json");
        std::fs::write(&dump, "{}").unwrap();
        let reply = envelope("x", serde_json::json!({ "blob": "y".repeat(2000) }));

        let err = encode_reply(&reply, &dump).unwrap_err();
        assert!(matches!(err, ProtocolError::SpillExists(_)));
    }

    #[test]
    fn test_pointer_over_limit_is_fatal() {
        let temp = TempDir::new().unwrap();
        // A dump path so deep the pointer envelope itself cannot fit.
        let mut deep = temp.path().to_path_buf();
        for _ in 0..40 {
            deep = deep.join("a".repeat(40));
        }
        std::fs::create_dir_all(&deep).unwrap();
        let dump = deep.join("reply.json");
        let reply = envelope("x", serde_json::json!({ "blob": "y".repeat(2000) }));

        let err = encode_reply(&reply, &dump).unwrap_err();
        assert!(matches!(err, ProtocolError::PointerTooLarge { .. }));
    }

    #[test]
    fn test_envelope_without_data_defaults_to_null() {
        let parsed: Envelope = serde_json::from_str(r#"{"cmd": "ping"}"#).unwrap();
        assert_eq!(parsed.data, Value::Null);
        // A payload-less unknown command stays an echo, not a parse failure.
        assert_eq!(
            Command::parse(&parsed).unwrap(),
            Command::Unknown {
                cmd: "ping".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_inbound_passthrough() {
        let plain = envelope("getPatchPool", Value::Null);
        let resolved = resolve_inbound(plain).unwrap();
        assert_eq!(resolved.cmd, "getPatchPool");
    }

    struct ScriptedHandler {
        dump_dir: PathBuf,
        iteration: u32,
        pool_calls: u32,
        kill_calls: u32,
    }

    #[async_trait]
    impl GatewayHandler for ScriptedHandler {
        async fn patch_pool(&mut self) -> anyhow::Result<Vec<PatchRef>> {
            self.pool_calls += 1;
            Ok(vec![PatchRef {
                index: "gen1_p1".to_string(),
            }])
        }

        async fn kill_matrix_and_new_goals(
            &mut self,
            suite: NewSuite,
        ) -> anyhow::Result<KillMatrixReply> {
            self.kill_calls += 1;
            Ok(KillMatrixReply {
                kill_matrix: vec![KillRecord {
                    test_name: format!("{}#t1", suite.classname),
                    killed_patches: vec!["gen1_p1".to_string()],
                }],
                patches: vec![],
                fix_locations: vec![FixLocation {
                    classname: "com.Foo".to_string(),
                    target_lines: vec![5],
                }],
            })
        }

        fn iteration(&self) -> u32 {
            self.iteration
        }

        fn advance_iteration(&mut self) {
            self.iteration += 1;
        }

        fn dump_dir(&self) -> &Path {
            &self.dump_dir
        }
    }

    async fn round_trip(stream: &mut TcpStream, request: &Envelope) -> Envelope {
        stream
            .write_all(&serde_json::to_vec(request).unwrap())
            .await
            .unwrap();
        let mut buf = [0u8; MESSAGE_LIMIT];
        let n = stream.read(&mut buf).await.unwrap();
        serde_json::from_slice(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn test_serve_session() {
        let temp = TempDir::new().unwrap();
        let gateway = Gateway::bind().await.unwrap();
        let port = gateway.port().unwrap();
        let mut handler = ScriptedHandler {
            dump_dir: temp.path().to_path_buf(),
            iteration: 1,
            pool_calls: 0,
            kill_calls: 0,
        };
        let deadline = Deadline::after(Duration::from_secs(30));

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

            let reply = round_trip(
                &mut stream,
                &envelope("getPatchPool", Value::Null),
            )
            .await;
            assert_eq!(reply.cmd, "getPatchPool");
            assert_eq!(reply.data["patches"][0]["index"], "gen1_p1");

            // An unknown command keeps the session alive.
            let reply = round_trip(&mut stream, &envelope("frobnicate", Value::Null)).await;
            assert_eq!(reply.cmd, "frobnicate");
            assert_eq!(reply.data, serde_json::json!([4, 0, 4]));

            let request = envelope(
                "getKillMatrixAndNewGoals",
                serde_json::json!({
                    "generation": 1,
                    "tests": ["t1"],
                    "classname": "com.FooTest",
                    "testSuitePath": "/tmp/FooTest.java",
                    "testScaffoldingPath": "/tmp/FooTest_scaffolding.java",
                }),
            );
            let reply = round_trip(&mut stream, &request).await;
            assert_eq!(reply.cmd, "getKillMatrixAndNewGoals");
            assert_eq!(reply.data["killMatrix"][0]["testName"], "com.FooTest#t1");

            stream
                .write_all(&serde_json::to_vec(&envelope("closeConnection", Value::Null)).unwrap())
                .await
                .unwrap();
        });

        gateway.serve(&mut handler, deadline).await.unwrap();
        client.await.unwrap();

        assert_eq!(handler.pool_calls, 1);
        assert_eq!(handler.kill_calls, 1);
        // Advanced exactly once, after the kill-matrix reply.
        assert_eq!(handler.iteration, 2);
    }

    /// Always answers with a pool large enough to force a spill.
    struct BigPoolHandler {
        dump_dir: PathBuf,
    }

    #[async_trait]
    impl GatewayHandler for BigPoolHandler {
        async fn patch_pool(&mut self) -> anyhow::Result<Vec<PatchRef>> {
            Ok((0..100)
                .map(|i| PatchRef {
                    index: format!("gen1_patch_{:04}", i),
                })
                .collect())
        }

        async fn kill_matrix_and_new_goals(
            &mut self,
            _suite: NewSuite,
        ) -> anyhow::Result<KillMatrixReply> {
            unreachable!("no suites announced in this session")
        }

        fn iteration(&self) -> u32 {
            1
        }

        fn advance_iteration(&mut self) {}

        fn dump_dir(&self) -> &Path {
            &self.dump_dir
        }
    }

    #[tokio::test]
    async fn test_repeated_oversized_replies_spill_separately() {
        let temp = TempDir::new().unwrap();
        let gateway = Gateway::bind().await.unwrap();
        let port = gateway.port().unwrap();
        let mut handler = BigPoolHandler {
            dump_dir: temp.path().to_path_buf(),
        };
        let deadline = Deadline::after(Duration::from_secs(30));

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            // Asking twice within one iteration is legal traffic; both
            // oversized replies must spill without colliding.
            for _ in 0..2 {
                let reply = round_trip(&mut stream, &envelope("getPatchPool", Value::Null)).await;
                assert_eq!(reply.cmd, "readJsonFile");
                let resolved = resolve_inbound(reply).unwrap();
                assert_eq!(resolved.data["patches"].as_array().unwrap().len(), 100);
            }
            stream
                .write_all(&serde_json::to_vec(&envelope("closeConnection", Value::Null)).unwrap())
                .await
                .unwrap();
        });

        gateway.serve(&mut handler, deadline).await.unwrap();
        client.await.unwrap();

        let spills = std::fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(spills, 2);
    }
}
