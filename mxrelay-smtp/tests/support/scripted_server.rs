//! A one-connection SMTP peer that follows a fixed script.
//!
//! Each step either sends a reply or reads one line from the client and
//! records it. Once `DATA` has been answered with `354`, the next read
//! collects the whole message up to the terminating `.` line instead.
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::Mutex,
    task::JoinHandle,
};

#[derive(Debug, Clone)]
pub enum Step {
    Send(&'static str),
    Expect,
    ExpectMessage,
    Hang(Duration),
    Close,
}

pub struct ScriptedServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl ScriptedServer {
    pub async fn start(script: Vec<Step>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&received);

        let task = tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);

            for step in script {
                match step {
                    Step::Send(reply) => {
                        if writer.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                        let _ = writer.flush().await;
                    }
                    Step::Expect => {
                        let mut line = String::new();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        log.lock().await.push(line.trim_end().to_string());
                    }
                    Step::ExpectMessage => {
                        let mut message = String::new();
                        loop {
                            let mut line = String::new();
                            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                                return;
                            }
                            if line == ".\r\n" {
                                break;
                            }
                            message.push_str(&line);
                        }
                        log.lock().await.push(message);
                    }
                    Step::Hang(duration) => tokio::time::sleep(duration).await,
                    Step::Close => return,
                }
            }
        });

        Self {
            addr,
            received,
            task,
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn received(&self) -> Vec<String> {
        self.received.lock().await.clone()
    }

    /// Wait until the script has run to completion.
    pub async fn finished(self) -> Vec<String> {
        let _ = self.task.await;
        self.received.lock().await.clone()
    }
}
