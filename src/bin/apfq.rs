use apfq::config::QosConfig;
use apfq::scheduler::Fifo;
use apfq::Datapath;
use color_eyre::{
    eyre::{eyre, Report},
    Help,
};
use structopt::StructOpt;
use tracing::info;

#[derive(StructOpt, Debug)]
#[structopt(name = "apfq")]
struct Opt {
    /// TAP interface that receives wired frames.
    #[structopt(short, long)]
    interface_name: String,

    /// Unix datagram socket that receives 802.11 frames.
    #[structopt(short, long)]
    fwd_address: std::path::PathBuf,

    #[structopt(short, long)]
    rate_bytes_per_sec: Option<usize>,

    /// Scheduler parameters, traffic rules and lvaps.
    #[structopt(short, long)]
    config: std::path::PathBuf,

    #[structopt(short, long, default_value = "drr")]
    scheduler: String,
}

pub fn main() -> Result<(), Report> {
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let opt = Opt::from_args();
    let cfg = QosConfig::from_file(&opt.config)?;
    info!(
        rules = cfg.rules.len(),
        lvaps = cfg.lvaps.len(),
        scheduler = ?cfg.scheduler,
        "loaded config"
    );

    match opt.scheduler.as_str() {
        "drr" => {
            let s = cfg.build(cfg.lvap_table())?;
            Datapath::new(
                &opt.interface_name,
                &opt.fwd_address,
                opt.rate_bytes_per_sec,
                s,
            )?
            .run()
        }
        "fifo" => {
            let s = Fifo::new(cfg.scheduler.capacity, cfg.lvap_table());
            Datapath::new(
                &opt.interface_name,
                &opt.fwd_address,
                opt.rate_bytes_per_sec,
                s,
            )?
            .run()
        }
        s => Err(eyre!("unknown scheduler {:?}", s)).note("supported schedulers are [drr, fifo]"),
    }
}
