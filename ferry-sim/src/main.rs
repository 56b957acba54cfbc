// ferry-sim: drives N protocol cores through random contacts with message loss.

mod config;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use ferry_core::{encode_frame, Disposition, FerryCore, File, HostId, LinkReader};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
    config: Option<PathBuf>,
    json: bool,
}

/// `None` when the invocation only asked for the version.
fn parse_args() -> Result<Option<Args>> {
    let mut args = Args {
        config: None,
        json: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("ferry-sim {}", VERSION);
                return Ok(None);
            }
            "--json" => args.json = true,
            "--config" | "-c" => {
                let path = it.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(Some(args))
}

#[derive(Debug, Default, Serialize)]
struct Report {
    seed: u64,
    hosts: usize,
    duration: f64,
    requests_issued: u64,
    requests_skipped: u64,
    transfers: u64,
    link_bytes: u64,
    lost: u64,
    refused: u64,
    files_delivered: u64,
    digests_verified: u64,
    digest_mismatches: u64,
    retransmissions: u64,
    chunks_regenerated: u64,
    evictions: u64,
    abandoned: u64,
}

struct Simulation {
    cfg: config::Config,
    nodes: Vec<FerryCore>,
    origins: BTreeMap<String, HostId>,
    digests: HashMap<String, [u8; 32]>,
    rng: StdRng,
    report: Report,
}

impl Simulation {
    fn new(cfg: config::Config) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut nodes = Vec::with_capacity(cfg.hosts);
        for i in 0..cfg.hosts {
            let host = HostId(u32::try_from(i).context("too many hosts")?);
            let seed = cfg.seed.wrapping_add(i as u64 + 1);
            nodes.push(FerryCore::with_seed(host, cfg.protocol.clone(), seed)?);
        }

        let mut origins = BTreeMap::new();
        let mut digests = HashMap::new();
        let data_len = cfg.protocol.data_len();
        for f in 0..cfg.files {
            let filename = format!("filename{f}");
            let owner = f % cfg.hosts;
            let data: Vec<u32> = (0..data_len).map(|_| rng.gen()).collect();
            let file = File::new(
                filename.clone(),
                nodes[owner].host(),
                cfg.protocol.file_size,
                data,
                0.0,
            );
            digests.insert(filename.clone(), file.digest());
            nodes[owner]
                .place_file(file)
                .with_context(|| format!("placing {filename}"))?;
            origins.insert(filename, nodes[owner].host());
        }

        let report = Report {
            seed: cfg.seed,
            hosts: cfg.hosts,
            duration: cfg.duration,
            ..Default::default()
        };
        Ok(Self {
            cfg,
            nodes,
            origins,
            digests,
            rng,
            report,
        })
    }

    fn run(&mut self) -> Result<()> {
        let tick = self.cfg.protocol.tick_interval;
        let steps = (self.cfg.duration / tick).round() as u64;
        let mut issued = 0;
        let mut next_request = 0.0;
        for step in 1..=steps {
            let now = step as f64 * tick;
            while issued < self.cfg.requests && now >= next_request {
                self.issue_request(now);
                issued += 1;
                next_request += self.cfg.request_interval;
            }
            let n = self.nodes.len();
            for a in 0..n {
                for b in a + 1..n {
                    if self.rng.gen_bool(self.cfg.contact_probability) {
                        self.contact(a, b, now)?;
                    }
                }
            }
            for node in &mut self.nodes {
                node.tick(now);
            }
        }
        for node in &self.nodes {
            let s = node.stats();
            self.report.retransmissions += s.retransmissions;
            self.report.chunks_regenerated += s.chunks_regenerated;
            self.report.evictions += s.evictions;
            self.report.abandoned += s.abandoned;
        }
        Ok(())
    }

    /// Random requester asks for a random file from a host that currently holds it.
    fn issue_request(&mut self, now: f64) {
        let requester = self.rng.gen_range(0..self.nodes.len());
        let f = self.rng.gen_range(0..self.origins.len());
        let Some((filename, &origin)) = self.origins.iter().nth(f) else {
            return;
        };
        let holder = if self.nodes[origin.0 as usize].has_file(filename) {
            Some(origin)
        } else {
            self.nodes
                .iter()
                .find(|n| n.has_file(filename))
                .map(FerryCore::host)
        };
        let txn = holder.and_then(|h| self.nodes[requester].create_request(filename, h, now));
        match txn {
            Some(txn) => {
                self.report.requests_issued += 1;
                debug!(requester, %filename, %txn, "request issued");
            }
            None => self.report.requests_skipped += 1,
        }
    }

    fn contact(&mut self, a: usize, b: usize, now: f64) -> Result<()> {
        self.transfer(a, b, now)?;
        self.transfer(b, a, now)
    }

    fn transfer(&mut self, from: usize, to: usize, now: f64) -> Result<()> {
        let src = self.nodes[from].host();
        let dst = self.nodes[to].host();
        let mut link = LinkReader::new();
        for queued in self.nodes[from].outgoing_for(dst) {
            let Some(sent) = self.nodes[from].take_outgoing(&queued.id) else {
                continue;
            };
            self.report.transfers += 1;
            if self.rng.gen_bool(self.cfg.loss_probability) {
                self.report.lost += 1;
                debug!(%src, %dst, id = %sent.id, "message lost");
                continue;
            }
            link.push(&encode_frame(&sent).with_context(|| format!("framing {}", sent.id))?);
            let msg = link
                .next_message()
                .with_context(|| format!("decoding {} at {dst}", sent.id))?
                .with_context(|| format!("incomplete frame for {}", sent.id))?;
            if !self.nodes[to].receive_message(&msg, src, now).is_accepted() {
                self.report.refused += 1;
                continue;
            }
            let filename = msg.filename.clone();
            let disposition = self.nodes[to]
                .on_message_transferred(msg, src, now)
                .with_context(|| format!("delivering {src} -> {dst} at t={now:.1}"))?;
            if disposition == Disposition::Reassembled {
                self.verify(to, &filename);
            }
        }
        self.report.link_bytes += link.bytes_read();
        Ok(())
    }

    fn verify(&mut self, node: usize, filename: &str) {
        self.report.files_delivered += 1;
        let host = self.nodes[node].host();
        let Some(file) = self.nodes[node].file(filename) else {
            warn!(%host, %filename, "delivered file was not cached");
            return;
        };
        if self.digests.get(filename) == Some(&file.digest()) {
            self.report.digests_verified += 1;
            info!(%host, %filename, "file delivered");
        } else {
            self.report.digest_mismatches += 1;
            warn!(%host, %filename, "digest mismatch");
        }
    }
}

fn main() -> Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::load(args.config.as_deref())?;
    info!(hosts = cfg.hosts, files = cfg.files, seed = cfg.seed, "starting simulation");

    let mut sim = Simulation::new(cfg)?;
    sim.run()?;

    let r = &sim.report;
    if args.json {
        println!("{}", serde_json::to_string_pretty(r)?);
    } else {
        println!("ferry-sim {VERSION} seed={} hosts={} t={}", r.seed, r.hosts, r.duration);
        println!("requests: {} issued, {} skipped", r.requests_issued, r.requests_skipped);
        println!(
            "transfers: {} ({} lost, {} refused), {} bytes on links",
            r.transfers, r.lost, r.refused, r.link_bytes
        );
        println!(
            "files: {} delivered, {} verified, {} mismatched",
            r.files_delivered, r.digests_verified, r.digest_mismatches
        );
        println!(
            "retransmissions: {}, chunks regenerated: {}, evictions: {}, abandoned: {}",
            r.retransmissions, r.chunks_regenerated, r.evictions, r.abandoned
        );
    }
    Ok(())
}
