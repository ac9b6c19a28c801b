use std::sync::Arc;

use tokio::sync::Mutex;

use carsearch::db::establish_connection_pool;
use carsearch::models::config::AppConfig;
use carsearch::processing::embedding::FastembedEmbedder;
use carsearch::processing::harvest::run_cycle;
use carsearch::processing::ZmqMessage;
use carsearch::repository::DieselRepository;
use carsearch::scrapers::build_scraper;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = match AppConfig::load("carsearch") {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let pool = match establish_connection_pool(&config.database_url) {
        Ok(pool) => pool,
        Err(e) => {
            log::error!("Failed to establish database connection: {e}");
            std::process::exit(1);
        }
    };
    let repo = DieselRepository::new(pool);

    // Model weights load once; cycles share the embedder behind a lock.
    let embedder = match FastembedEmbedder::new() {
        Ok(embedder) => embedder,
        Err(e) => {
            log::error!("Failed to initialize embedding model: {e}");
            std::process::exit(1);
        }
    };
    let embedder = Arc::new(Mutex::new(embedder));
    let config = Arc::new(config);

    let context = zmq::Context::new();
    let responder = context.socket(zmq::PULL).expect("Cannot create zmq socket");
    responder
        .bind(&config.zmq_address)
        .expect("Cannot bind to zmq port");

    loop {
        let msg = responder.recv_bytes(0).unwrap();
        match serde_json::from_slice::<ZmqMessage>(&msg) {
            Ok(parsed) => {
                let repo = repo.clone();
                let embedder = Arc::clone(&embedder);
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    let selected = match parsed {
                        ZmqMessage::HarvestCycle => config.harvest.sources.clone(),
                        ZmqMessage::HarvestSources(names) => config
                            .harvest
                            .sources
                            .iter()
                            .filter(|source| names.contains(&source.selector))
                            .cloned()
                            .collect(),
                    };

                    let mut sources = Vec::new();
                    for source in &selected {
                        match build_scraper(source) {
                            Ok(scraper) => sources.push((scraper, source.pages)),
                            Err(e) => log::error!("Skipping source {}: {e}", source.selector),
                        }
                    }
                    if sources.is_empty() {
                        log::warn!("No runnable sources in request, cycle skipped");
                        return;
                    }

                    let mut embedder = embedder.lock().await;
                    match run_cycle(&repo, sources, &mut *embedder, &config).await {
                        Ok(report) => log::info!(
                            "Harvest cycle finished: created={} merged={} deactivated={} embedded={} pending={}",
                            report.created,
                            report.merged,
                            report.deactivated,
                            report.embedded,
                            report.pending,
                        ),
                        Err(e) => log::error!("Harvest cycle failed: {e}"),
                    }
                });
            }
            Err(e) => log::error!("Failed to parse JSON: {e}"),
        }
    }
}
