use clap::{Parser, Subcommand};
use std::path::PathBuf;

use castbridge::Config;

#[derive(Parser, Debug)]
#[command(name = "castbridge")]
#[command(version)]
#[command(about = "Bridges a screen-capture agent to WebRTC viewers", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "castbridge.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept the capture agent and serve viewers (default)
    Serve {
        /// Agent listener port
        #[arg(short, long)]
        port: Option<u16>,

        /// HTTP/WebSocket port
        #[arg(long)]
        http_port: Option<u16>,

        /// Viewer password
        #[arg(long)]
        password: Option<String>,

        /// Directory served to browsers
        #[arg(long)]
        web_root: Option<PathBuf>,

        /// Expect the adb device-name preamble on the first agent socket
        #[arg(long, action)]
        adb: bool,

        /// Accept viewers from any address
        #[arg(long, action)]
        allow_wan: bool,
    },
    /// Log into a remote bridge and relay its video as framed H264
    View {
        /// Signaling URL, e.g. ws://192.168.1.20:8008/ws
        #[arg(long)]
        server: Option<String>,

        /// TCP address receiving the framed stream
        #[arg(long)]
        output: Option<String>,

        /// Bridge password
        #[arg(long)]
        password: Option<String>,

        /// maxSize hint sent with the login
        #[arg(long)]
        max_size: Option<u32>,
    },
}

impl Args {
    pub fn load_config(&self) -> Result<Config, Box<dyn std::error::Error>> {
        Config::load(&self.config)
    }

    /// Fold command line flags into `config`
    pub fn apply_overrides(&self, config: &mut Config) {
        match &self.command {
            Some(Command::Serve {
                port,
                http_port,
                password,
                web_root,
                adb,
                allow_wan,
            }) => {
                if let Some(port) = port {
                    config.receiver.port = *port;
                }
                if let Some(port) = http_port {
                    config.http.port = *port;
                }
                if let Some(password) = password {
                    config.auth.password = password.clone();
                }
                if web_root.is_some() {
                    config.http.web_root = web_root.clone();
                }
                if *adb {
                    config.receiver.use_adb = true;
                }
                if *allow_wan {
                    config.http.lan_only = false;
                }
            }
            Some(Command::View {
                server,
                output,
                password,
                max_size,
            }) => {
                if let Some(server) = server {
                    config.viewer.server_url = server.clone();
                }
                if let Some(output) = output {
                    config.viewer.output = output.clone();
                }
                if let Some(password) = password {
                    config.auth.password = password.clone();
                }
                if let Some(max_size) = max_size {
                    config.viewer.max_size = *max_size;
                }
            }
            None => {}
        }
    }
}
