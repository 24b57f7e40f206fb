use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

mod app;
mod backfill;
mod catalog;
mod cli;
mod client;
mod config;
mod images;
mod search;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::SearchApp;
use catalog::CatalogCsv;
use cli::{Command, SearchArgs};
use client::{HttpTransport, OrchestratorOptions, QueryOrchestrator, SearchState, Status};
use config::Config;

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn backfill(app: &SearchApp, batch_size: usize, drain: bool) -> anyhow::Result<()> {
    if !drain {
        let report = app.backfill.run_batch(batch_size)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let pb = indicatif::ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(format!("{} products pending", app.backfill.pending()?));

    let (mut success, mut failed) = (0, 0);
    loop {
        let report = app.backfill.run_batch(batch_size)?;
        success += report.success;
        failed += report.failed;
        pb.set_message(format!(
            "embedded {success}, failed {failed}, {} pending",
            app.backfill.pending()?
        ));
        if !report.remaining {
            break;
        }
    }
    pb.finish_with_message(format!("done: embedded {success}, failed {failed}"));
    Ok(())
}

fn print_state(state: &SearchState) {
    match state.status {
        Status::Idle => println!("[{}] idle", state.seq),
        Status::Loading => println!("[{}] searching...", state.seq),
        Status::Failed => println!(
            "[{}] {}",
            state.seq,
            state
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default()
        ),
        Status::Ready => {
            println!("[{}] {} products", state.seq, state.results.products.len());
            for r in &state.results.products {
                println!(
                    "  {:.3}  {} ({} {:.2})",
                    r.relevance_score, r.product.title, r.product.currency, r.product.price
                );
            }
            if !state.results.suggestions.is_empty() {
                println!("  suggestions: {}", state.results.suggestions.join(", "));
            }
        }
    }
}

async fn interactive(addr: &str) -> anyhow::Result<()> {
    use tokio::io::AsyncBufReadExt;

    let orchestrator =
        QueryOrchestrator::new(HttpTransport::new(addr), OrchestratorOptions::default());
    let mut rx = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            print_state(&state);
        }
    });

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.strip_prefix('@') {
            Some(path) => {
                let path = path.trim();
                match tokio::fs::read(path).await {
                    Ok(bytes) => orchestrator.search_image(bytes, None),
                    Err(err) => log::error!("couldnt read {path}: {err}"),
                }
            }
            None => orchestrator.search_text(&line),
        }
    }

    // let the last request land before exiting
    tokio::time::sleep(Duration::from_secs(1)).await;
    printer.abort();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    init_logging();

    let config = Config::load()?;

    match args.command {
        Command::Serve { listen } => {
            let listen_addr = listen.unwrap_or_else(|| config.listen_addr.clone());
            let app = SearchApp::open(&config)?;
            web::start_daemon(app, &listen_addr)
        }

        Command::Backfill { batch_size, drain } => {
            let app = SearchApp::open(&config)?;
            let batch_size = batch_size.unwrap_or(config.search.backfill_batch_size).max(1);
            backfill(&app, batch_size, drain)
        }

        Command::Search(SearchArgs::Text { query, limit }) => {
            let app = SearchApp::open(&config)?;
            let ranker = app.ranker.clone();
            let response = runtime()?.block_on(async move {
                ranker.search_text(&query, limit, None).await
            })?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }

        Command::Search(SearchArgs::Image { path, limit }) => {
            let bytes = std::fs::read(&path).with_context(|| format!("couldnt read {path:?}"))?;
            let app = SearchApp::open(&config)?;
            let ranker = Arc::clone(&app.ranker);
            let response = runtime()?.block_on(async move {
                ranker.search_image(bytes, None, limit).await
            })?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }

        Command::Interactive { addr } => runtime()?.block_on(interactive(&addr)),

        Command::Import { products, taxonomy } => {
            let catalog = CatalogCsv::load(config.base_path())?;
            let count = catalog.import(&products, taxonomy.as_deref())?;
            println!("imported {count} products");
            Ok(())
        }
    }
}
