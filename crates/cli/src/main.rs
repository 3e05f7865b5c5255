use clap::Parser;
use satip::{CaPmtListMode, RtspServer, ServerConfig, StreamManager};
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "satip-server", about = "SAT>IP server for local DVB tuners")]
struct Args {
    /// HTTP port advertised to the web interface collaborator
    #[arg(long, default_value_t = 8875)]
    http_port: u16,

    /// RTSP port to listen on
    #[arg(long, default_value_t = 554)]
    rtsp_port: u16,

    /// Application data directory (XML settings)
    #[arg(long, default_value = ".")]
    appdata_path: PathBuf,

    /// Static web content directory
    #[arg(long, default_value = "web")]
    web_path: PathBuf,

    /// Network interface to bind (first usable when omitted)
    #[arg(long)]
    iface: Option<String>,

    /// Root of the DVB device tree
    #[arg(long, default_value = "/dev/dvb")]
    dvb_path: PathBuf,

    /// Enable descrambling through a DVB-API control-word provider
    #[arg(long)]
    decrypt: bool,

    /// Control-word provider host
    #[arg(long, default_value = "127.0.0.1")]
    decrypt_host: String,

    /// Control-word provider port
    #[arg(long, default_value_t = 15011)]
    decrypt_port: u16,

    /// Demux index offset reported to the provider
    #[arg(long, default_value_t = 0)]
    adapter_offset: u8,

    /// Strip CA descriptors from PMTs before they reach clients
    #[arg(long)]
    rewrite_pmt: bool,

    /// Push CA-PMT as list-only (0x03) instead of list-only-update (0x05)
    #[arg(long)]
    ca_pmt_list_only: bool,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = ServerConfig::for_interface(args.iface.as_deref());
    config.http_port = args.http_port;
    config.rtsp_port = args.rtsp_port;
    config.app_data_path = args.appdata_path;
    config.web_path = args.web_path;
    config.dvb_path = args.dvb_path;
    config.decrypt.enabled = args.decrypt;
    config.decrypt.server_addr = args.decrypt_host;
    config.decrypt.server_port = args.decrypt_port;
    config.decrypt.adapter_offset = args.adapter_offset;
    config.decrypt.rewrite_pmt = args.rewrite_pmt;
    if args.ca_pmt_list_only {
        config.decrypt.list_mode = CaPmtListMode::ListOnly;
    }

    let manager = StreamManager::new(&config);
    let mut server = RtspServer::new(config, manager);

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return;
    }

    println!("SAT>IP server running — press Enter to stop");
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);

    server.stop();
}
