//! Command-line front end for the load engine.

use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Arg, ArgAction, Command, value_parser};
use log::debug;

use loadline::config::{HeaderOverrides, TlsClientConfig, WorkerConfig};
use loadline::error::{Error, Result};
use loadline::report::{Recorder, RunSummary};
use loadline::url::UrlTable;
use loadline::worker::Worker;

const REPORT_INTERVAL: u64 = 5;

fn cli() -> Command {
    Command::new("loadline")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Closed-loop HTTP/HTTPS load generator")
        // -V is taken by --verify.
        .disable_version_flag(true)
        .arg(
            Arg::new("version")
                .long("version")
                .action(ArgAction::Version)
                .help("Print version information"),
        )
        .arg(
            Arg::new("concurrency")
                .short('c')
                .long("concurrency")
                .value_parser(value_parser!(usize))
                .default_value("1")
                .help("Number of concurrent connections"),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_parser(value_parser!(u64))
                .default_value("60")
                .help("Test duration in seconds"),
        )
        .arg(
            Arg::new("warmup")
                .short('w')
                .long("warmup")
                .value_parser(value_parser!(u64))
                .default_value("0")
                .help("Warm-up duration in seconds, not counted in results"),
        )
        .arg(
            Arg::new("threads")
                .short('K')
                .long("iothreads")
                .value_parser(value_parser!(usize))
                .help("Number of I/O threads (default: CPU cores)"),
        )
        .arg(
            Arg::new("method")
                .short('x')
                .long("method")
                .default_value("GET")
                .help("HTTP request method"),
        )
        .arg(
            Arg::new("header")
                .short('H')
                .long("header")
                .action(ArgAction::Append)
                .value_name("NAME: VALUE")
                .help("HTTP header line; repeatable"),
        )
        .arg(
            Arg::new("input-file")
                .short('f')
                .long("input-file")
                .value_name("FILE")
                .help("File to send as the request body"),
        )
        .arg(
            Arg::new("content-type")
                .short('t')
                .long("content-type")
                .help("Value of the Content-Type header"),
        )
        .arg(
            Arg::new("keep-alive")
                .short('k')
                .long("keep-alive")
                .value_parser(value_parser!(i64))
                .allow_negative_numbers(true)
                .help("0 disables connection reuse (default: always reuse)"),
        )
        .arg(
            Arg::new("think-time")
                .short('W')
                .long("think-time")
                .value_parser(value_parser!(u64))
                .value_name("MS")
                .help("Pause between requests on each connection, in milliseconds"),
        )
        .arg(
            Arg::new("one")
                .short('1')
                .long("one")
                .action(ArgAction::SetTrue)
                .help("Send one request per connection and exit"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Log the per-connection I/O trace to stderr"),
        )
        .arg(
            Arg::new("csv")
                .short('S')
                .long("csv-output")
                .action(ArgAction::SetTrue)
                .help("Output results as a single CSV line"),
        )
        .arg(
            Arg::new("header-line")
                .short('T')
                .long("header-line")
                .action(ArgAction::SetTrue)
                .help("Do not run; print the CSV header line"),
        )
        .arg(
            Arg::new("name")
                .short('N')
                .long("name")
                .help("Run name for the CSV output"),
        )
        .arg(
            Arg::new("cipherlist")
                .short('C')
                .long("cipherlist")
                .help("Restrict TLS cipher suites to those matching this string"),
        )
        .arg(
            Arg::new("verify")
                .short('V')
                .long("verify")
                .action(ArgAction::SetTrue)
                .help("Verify the TLS peer (off by default)"),
        )
        .arg(
            Arg::new("certificate")
                .short('F')
                .long("certificate")
                .value_name("PEM")
                .help("PEM file containing CA certificates to trust"),
        )
        .arg(
            Arg::new("target")
                .value_name("URL | @FILE")
                .required_unless_present("header-line")
                .help("An http(s) URL, or @file with one URL per line"),
        )
}

fn main() {
    if let Err(e) = run() {
        eprintln!("loadline: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let matches = cli().get_matches();
    let verbose = matches.get_flag("verbose");

    env_logger::Builder::from_default_env()
        .filter_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    if matches.get_flag("header-line") {
        RunSummary::write_csv_header(&mut io::stdout().lock())?;
        return Ok(());
    }

    let target = matches
        .get_one::<String>("target")
        .expect("target is required");
    let urls = Arc::new(match target.strip_prefix('@') {
        Some(path) => UrlTable::init_file(path)?,
        None => UrlTable::init_one(target)?,
    });

    let concurrency = *matches.get_one::<usize>("concurrency").unwrap_or(&1);
    let duration = *matches.get_one::<u64>("duration").unwrap_or(&60);
    let warmup = *matches.get_one::<u64>("warmup").unwrap_or(&0);
    let run_once = matches.get_flag("one");
    let csv = matches.get_flag("csv");

    let send_data = match matches.get_one::<String>("input-file") {
        Some(path) => Bytes::from(std::fs::read(path)?),
        None => Bytes::new(),
    };

    let mut headers: Vec<String> = Vec::new();
    let mut headers_set = HeaderOverrides::default();
    if let Some(values) = matches.get_many::<String>("header") {
        for h in values {
            let name = h.split(':').next().unwrap_or("").trim();
            headers_set.note(name);
            headers.push(h.clone());
        }
    }
    if let Some(ct) = matches.get_one::<String>("content-type") {
        headers.push(format!("Content-Type: {ct}"));
        headers_set.note("Content-Type");
    }

    let tls = if urls.any_tls() {
        Some(TlsClientConfig {
            client_config: Arc::new(build_tls_config(&matches)?),
        })
    } else {
        None
    };

    let mut threads = match matches.get_one::<usize>("threads") {
        Some(&n) => n.max(1),
        None => std::thread::available_parallelism().map_or(1, |n| n.get()),
    };
    threads = threads.min(concurrency).max(1);

    ensure_nofile_limit(concurrency)?;

    let template = WorkerConfig {
        num_connections: 0,
        verbose,
        http_verb: matches
            .get_one::<String>("method")
            .cloned()
            .unwrap_or_else(|| "GET".to_string()),
        send_data,
        headers,
        headers_set,
        think_time: matches
            .get_one::<u64>("think-time")
            .filter(|&&ms| ms > 0)
            .map(|&ms| Duration::from_millis(ms)),
        no_keep_alive: matches.get_one::<i64>("keep-alive") == Some(&0),
        run_once,
        tls,
        signer: None,
    };

    let mut workers = Vec::with_capacity(threads);
    let base = concurrency / threads;
    let extra = concurrency % threads;
    for i in 0..threads {
        let mut config = template.clone();
        config.num_connections = base + usize::from(i < extra);
        workers.push(Worker::new(i, config, Arc::clone(&urls))?);
    }
    debug!("running {concurrency} connections on {threads} threads");

    if run_once {
        let mut recorder = Recorder::start(&workers);
        for w in &mut workers {
            w.start()?;
        }
        for w in &mut workers {
            w.join();
        }
        recorder.finish(&workers);
        report(&recorder, &matches, threads, concurrency)?;
        return Ok(());
    }

    for w in &mut workers {
        w.start()?;
    }
    if warmup > 0 {
        eprintln!("warming up for {warmup} seconds");
        std::thread::sleep(Duration::from_secs(warmup));
    }

    let mut recorder = Recorder::start(&workers);
    let mut remaining = duration;
    while remaining > 0 {
        let step = remaining.min(REPORT_INTERVAL);
        std::thread::sleep(Duration::from_secs(step));
        remaining -= step;
        if !csv {
            let r = recorder.interval(&workers);
            println!("({:.0} / {duration}) {:.3}", r.elapsed, r.throughput);
        }
    }

    for w in &workers {
        w.request_stop(Duration::from_secs(2));
    }
    for w in &mut workers {
        w.join();
    }
    recorder.finish(&workers);
    report(&recorder, &matches, threads, concurrency)
}

fn report(
    recorder: &Recorder,
    matches: &clap::ArgMatches,
    threads: usize,
    concurrency: usize,
) -> Result<()> {
    let summary = recorder.summary();
    let mut out = io::stdout().lock();
    if matches.get_flag("csv") {
        let name = matches
            .get_one::<String>("name")
            .map(String::as_str)
            .unwrap_or("");
        summary.write_csv(&mut out, name, threads, concurrency)?;
    } else {
        summary.write_text(&mut out)?;
    }
    Ok(())
}

// ── TLS client configuration ────────────────────────────────────────────

/// Accept any server certificate. A benchmark talks to hosts it was pointed
/// at, often with self-signed certificates; verification is opt-in.
#[derive(Debug)]
struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn build_tls_config(matches: &clap::ArgMatches) -> Result<rustls::ClientConfig> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Some(filter) = matches.get_one::<String>("cipherlist") {
        let needle = filter.to_ascii_lowercase();
        provider
            .cipher_suites
            .retain(|s| format!("{:?}", s.suite()).to_ascii_lowercase().contains(&needle));
        if provider.cipher_suites.is_empty() {
            return Err(Error::Io(io::Error::other(format!(
                "no cipher suites match {filter:?}"
            ))));
        }
    }
    let provider = Arc::new(provider);

    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let config = if matches.get_flag("verify") {
        let mut roots = rustls::RootCertStore::empty();
        let path = matches.get_one::<String>("certificate").ok_or_else(|| {
            Error::Io(io::Error::other("--verify requires --certificate <PEM>"))
        })?;
        let mut reader = BufReader::new(File::open(path)?);
        for cert in rustls_pemfile::certs(&mut reader) {
            roots.add(cert?)?;
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth()
    };
    Ok(config)
}

// ── Process limits ──────────────────────────────────────────────────────

/// Raise RLIMIT_NOFILE when the requested concurrency needs it. Each
/// connection holds one descriptor; workers add a poll fd and a waker each.
fn ensure_nofile_limit(connections: usize) -> Result<()> {
    let required = connections as u64 + 64;
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // Safety: getrlimit writes into the struct we hand it.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if rlim.rlim_cur >= required {
        return Ok(());
    }
    if rlim.rlim_max != libc::RLIM_INFINITY && rlim.rlim_max < required {
        return Err(Error::Io(io::Error::other(format!(
            "file descriptor hard limit {} is too low for {connections} connections; \
             raise it with: ulimit -n {required}",
            rlim.rlim_max
        ))));
    }
    rlim.rlim_cur = if rlim.rlim_max == libc::RLIM_INFINITY {
        required
    } else {
        required.min(rlim.rlim_max)
    };
    // Safety: plain setrlimit call with a valid struct.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}
