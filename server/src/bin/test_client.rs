use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use shared::{ClientHandler, EnvelopeCodec, Message, Registry, Unit, PROTOCOL_VERSION};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Minimal terminal client: prints everything the server sends, sends typed
/// lines as chat and `/lines` as commands.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:7777")]
    server: String,
    /// Username to log in with
    #[clap(short, long)]
    name: String,
    /// Password, required if the username is registered with one
    #[clap(short, long)]
    password: Option<String>,
}

struct Printer {
    connected: bool,
}

impl ClientHandler for Printer {
    fn chat(&mut self, text: &str) {
        println!("{}", text);
    }

    fn disconnected(&mut self, reason: &str) {
        println!("Disconnected: {}", reason);
        self.connected = false;
    }

    fn handshake(&mut self, version: &str) {
        println!("Connected to server running {}", version);
    }

    fn init_board(&mut self, width: i32, height: i32) {
        println!("Board is {}x{}", width, height);
    }

    fn add_unit(&mut self, unit: &Unit) {
        println!(
            "Unit {} ({}) at ({}, {})",
            unit.name, unit.uid, unit.x, unit.y
        );
    }

    fn move_unit(&mut self, uid: i32, to: (i32, i32), from: (i32, i32)) {
        println!("Unit {} moved {:?} -> {:?}", uid, from, to);
    }
}

fn message_for_line(line: &str) -> Option<Message> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match line.strip_prefix('/') {
        Some(command) => {
            let (name, rest) = match command.split_once(' ') {
                Some((name, rest)) => (name, Some(rest.trim().to_string())),
                None => (command, None),
            };
            Some(Message::Command {
                name: name.to_string(),
                command: rest.filter(|r| !r.is_empty()),
            })
        }
        None => Some(Message::chat(line)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let stream = TcpStream::connect(&args.server).await?;
    println!("Connected to {}", args.server);

    let codec = EnvelopeCodec::new(Arc::new(Registry::standard()));
    let mut framed = Framed::new(stream, codec);

    framed
        .send(Message::Handshake {
            version: PROTOCOL_VERSION.to_string(),
        })
        .await?;
    framed
        .send(Message::Validation {
            name: args.name.clone(),
            password: args.password.clone(),
        })
        .await?;

    let mut printer = Printer { connected: true };
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    while printer.connected {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(message)) => {
                    if let Some(reply) = message.apply_to_client(&mut printer) {
                        framed.send(reply).await?;
                    }
                }
                Some(Err(e)) => {
                    println!("Bad message from server: {}", e);
                    break;
                }
                None => {
                    println!("Server closed the connection");
                    break;
                }
            },
            line = input.next_line() => match line? {
                Some(line) => {
                    if let Some(message) = message_for_line(&line) {
                        framed.send(message).await?;
                    }
                }
                None => {
                    framed.send(Message::close("client quit")).await?;
                    break;
                }
            },
        }
    }

    println!("Test client finished");
    Ok(())
}
