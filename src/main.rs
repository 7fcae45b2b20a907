//! locshare - time-limited location sharing.
//!
//! Usage:
//!   locshare serve [--port 8080]                 # Run the shared store service
//!   locshare track [--push]                      # Generate a link and watch the map
//!   locshare submit <LINK> --lat X --lon Y       # Share a location into a session
//!   locshare check <LINK>                        # Validate a link

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use locshare::clock::{Clock, SystemClock};
use locshare::config::{
    FeedMode, ServerConfig, TrackerConfig, DEFAULT_STORE_URL, NOMINATIM_URL, POLL_INTERVAL,
};
use locshare::geocode::{Geocoder, NoGeocoder, NominatimGeocoder};
use locshare::http_server;
use locshare::link::{self, Role};
use locshare::map::{ConsoleMap, MapRenderer};
use locshare::position::{
    FixedSource, LocationError, PositionSource, ReplaySource, WatchOptions,
};
use locshare::session::{InvalidReason, SessionId, SessionManager, Validity};
use locshare::state::AppState;
use locshare::store::HttpStore;
use locshare::submitter::{Submitter, SubmitterState};
use locshare::tracker::Tracker;
use locshare::{Error, Result};

#[derive(Parser, Debug)]
#[command(name = "locshare")]
#[command(about = "Time-limited location sharing between a tracker and a submitter")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the shared store HTTP service
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Generate a tracking link and show received locations.
    /// Press Enter to replace the link with a fresh one.
    Track {
        /// Base URL of the store service
        #[arg(long, env = "LOCSHARE_STORE_URL", default_value = DEFAULT_STORE_URL)]
        store_url: String,

        /// Origin and path the shareable link points at
        #[arg(long, default_value = DEFAULT_STORE_URL)]
        base_url: String,

        /// Subscribe to pushed updates instead of polling
        #[arg(long)]
        push: bool,

        /// Poll cadence in milliseconds
        #[arg(long, default_value_t = POLL_INTERVAL.as_millis() as u64)]
        poll_interval_ms: u64,
    },
    /// Share this device's location into the session of a link
    Submit {
        /// Link received from the tracker
        link: String,

        /// Base URL of the store service
        #[arg(long, env = "LOCSHARE_STORE_URL", default_value = DEFAULT_STORE_URL)]
        store_url: String,

        /// Consent up front instead of waiting for Enter
        #[arg(long)]
        yes: bool,

        /// Replay fixes from a JSON-lines track file
        #[arg(long, conflicts_with_all = ["lat", "lon"])]
        replay: Option<PathBuf>,

        /// Latitude of a fixed position
        #[arg(long, allow_hyphen_values = true, required_unless_present = "replay")]
        lat: Option<f64>,

        /// Longitude of a fixed position
        #[arg(long, allow_hyphen_values = true, required_unless_present = "replay")]
        lon: Option<f64>,

        /// Accuracy of a fixed position in metres
        #[arg(long, default_value = "10")]
        accuracy: f64,

        /// Nominatim reverse endpoint
        #[arg(long, default_value = NOMINATIM_URL)]
        geocoder_url: String,

        /// Skip reverse geocoding
        #[arg(long)]
        no_geocode: bool,

        /// How often the location watch checks for a new fix, in milliseconds
        #[arg(long, default_value = "1000")]
        sample_interval_ms: u64,
    },
    /// Check whether a link's session is still valid
    Check {
        link: String,

        /// Base URL of the store service
        #[arg(long, env = "LOCSHARE_STORE_URL", default_value = DEFAULT_STORE_URL)]
        store_url: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match run(args.command).await {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    }
}

async fn run(command: Commands) -> Result<i32> {
    match command {
        Commands::Serve { port } => {
            http_server::run_server(ServerConfig { port }, AppState::new()).await?;
            Ok(0)
        }
        Commands::Track {
            store_url,
            base_url,
            push,
            poll_interval_ms,
        } => {
            let feed = if push {
                FeedMode::Push {
                    store_url: store_url.clone(),
                }
            } else {
                FeedMode::Poll {
                    interval: Duration::from_millis(poll_interval_ms),
                }
            };
            track(&store_url, TrackerConfig { base_url, feed }).await?;
            Ok(0)
        }
        Commands::Submit {
            link,
            store_url,
            yes,
            replay,
            lat,
            lon,
            accuracy,
            geocoder_url,
            no_geocode,
            sample_interval_ms,
        } => {
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let source: Box<dyn PositionSource> = match (replay, lat, lon) {
                (Some(path), _, _) => Box::new(ReplaySource::from_file(path, clock.clone())?),
                (None, Some(lat), Some(lon)) => {
                    Box::new(FixedSource::new(lat, lon, accuracy, clock.clone()))
                }
                _ => return Err(LocationError::PositionUnavailable.into()),
            };
            let geocoder: Arc<dyn Geocoder> = if no_geocode {
                Arc::new(NoGeocoder)
            } else {
                Arc::new(NominatimGeocoder::with_endpoint(geocoder_url)?)
            };
            let options = WatchOptions {
                sample_interval: Duration::from_millis(sample_interval_ms),
                ..WatchOptions::default()
            };
            submit(&link, &store_url, clock, source, geocoder, options, yes).await
        }
        Commands::Check { link, store_url } => {
            let id = session_of(&link)?;
            let sessions = sessions_at(&store_url)?;
            match sessions.check_validity(&id).await? {
                Validity::Valid(meta) => {
                    println!("Session {} is valid until {}", id, meta.expires);
                    Ok(0)
                }
                Validity::Invalid(reason) => {
                    print_invalid_view(reason);
                    Ok(1)
                }
            }
        }
    }
}

fn sessions_at(store_url: &str) -> Result<SessionManager> {
    Ok(SessionManager::new(
        Arc::new(HttpStore::new(store_url)?),
        Arc::new(SystemClock),
    ))
}

fn session_of(raw_link: &str) -> Result<SessionId> {
    match link::parse(raw_link)? {
        Role::Submitter(id) => Ok(id),
        Role::Tracker => Err(Error::InvalidLink(
            "link has no session parameter (it opens the tracker)".to_string(),
        )),
    }
}

fn print_invalid_view(reason: InvalidReason) {
    println!("Link expired or invalid");
    println!("{}", reason.message());
    println!("Please ask the tracker for a new link.");
}

async fn track(store_url: &str, config: TrackerConfig) -> Result<()> {
    let maps = Arc::new(|id: &SessionId| Box::new(ConsoleMap::new(id.clone())) as Box<dyn MapRenderer>);
    let mut tracker = Tracker::new(sessions_at(store_url)?, config, maps);

    let link = tracker.generate_link().await?;
    println!("Send this link to the device to be tracked. Its user must confirm before sharing starts:");
    println!("{}", link);
    println!("(Enter: new link, Ctrl-C: quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(_)) => {
                    let link = tracker.generate_link().await?;
                    println!("New link (previous one is no longer watched):");
                    println!("{}", link);
                }
                Ok(None) => stdin_open = false,
                Err(e) => return Err(e.into()),
            },
        }
    }

    tracker.shutdown().await;
    Ok(())
}

async fn submit(
    raw_link: &str,
    store_url: &str,
    clock: Arc<dyn Clock>,
    source: Box<dyn PositionSource>,
    geocoder: Arc<dyn Geocoder>,
    options: WatchOptions,
    yes: bool,
) -> Result<i32> {
    let id = session_of(raw_link)?;
    let sessions = SessionManager::new(Arc::new(HttpStore::new(store_url)?), clock);
    info!(session_id = %id, "Submitter mode");

    if let Validity::Invalid(reason) = sessions.check_validity(&id).await? {
        print_invalid_view(reason);
        return Ok(1);
    }

    println!("Location sharing - session {}", id);
    let submitter = Submitter::new(id, sessions, geocoder, options);

    let mut status = submitter.subscribe();
    let printer = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            println!("Status: {}", current.message);
            if let Some(detail) = current.detail {
                println!("{}", detail);
            }
        }
    });

    let consent = async move {
        if yes {
            return true;
        }
        println!("Press Enter to start sharing your location.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        matches!(lines.next_line().await, Ok(Some(_)))
    };
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    let summary = submitter.run(source, consent, shutdown).await;
    let _ = printer.await;

    info!(
        fixes = summary.fixes,
        written = summary.written,
        stale = summary.stale,
        failed_writes = summary.failed_writes,
        state = ?summary.final_state,
        "Submitter finished"
    );
    match summary.final_state {
        SubmitterState::LinkInvalid(_) => Ok(1),
        _ => Ok(0),
    }
}
