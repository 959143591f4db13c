mod app;

use crate::app::{App, Report};
use clap::{Args, Parser, Subcommand};
use miette::{Result, miette};
use shelf_catalog::{Book, BookHash};
use shelf_config::Config;
use shelf_events::error::ErrorKind as EventsErrorKind;
use shelf_events::Consumer;
use shelf_library::error::ErrorKind as LibraryErrorKind;
use shelf_library::{NewBook, events};
use std::path::PathBuf;
use std::str::FromStr;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "shelf", version, about = "Book content pipeline")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(short, long, global = true, env = "SHELF_CONFIG")]
    config: Option<PathBuf>,
    /// Increase log verbosity. `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the deletion reconciler until interrupted.
    Run {
        /// Handle a single batch, print what happened and exit.
        #[arg(long)]
        once: bool,
    },
    /// Store a book's content and catalog it.
    Upload {
        #[arg(long)]
        owner: Uuid,
        #[arg(long)]
        title: String,
        /// File to read; `-` reads standard input.
        file: PathBuf,
    },
    /// Remove a book from the catalog and queue its content for deletion.
    Delete { id: Uuid },
    /// Show one or more books.
    Show(ShowArgs),
    /// List an owner's books, newest first.
    List {
        #[arg(long)]
        owner: Uuid,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Write a book's content to standard output.
    Cat { id: Uuid },
    /// Show the state of the deletion queue.
    Status,
}

#[derive(Args)]
struct ShowArgs {
    /// Look up by book ID.
    id: Option<Uuid>,
    /// Look up by content hash (hex SHA-256).
    #[arg(long, conflicts_with_all = ["id", "title"])]
    hash: Option<String>,
    /// Look up by title; requires `--owner`.
    #[arg(long, requires = "owner", conflicts_with = "id")]
    title: Option<String>,
    #[arg(long)]
    owner: Option<Uuid>,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref()).report("loading configuration")?;
    let app = App::open(config).await?;
    let result = execute(&app, cli.command).await;
    app.close().await;
    result
}

async fn execute(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Run { once } => run(app, once).await,
        Command::Upload { owner, title, file } => upload(app, NewBook::new(title, owner), file).await,
        Command::Delete { id } => {
            app.service.delete(id).await.map_err(|e| library_error(e, &id))?;
            println!("deleted {id}");
            Ok(())
        },
        Command::Show(args) => show(app, args).await,
        Command::List { owner, limit, offset } => {
            let books = app.service.get_many_by_user_id(owner, limit, offset).await.map_err(|e| library_error(e, &owner))?;
            books.iter().for_each(print_book);
            Ok(())
        },
        Command::Cat { id } => {
            let content = app.service.get_book_content_by_id(id).await.map_err(|e| library_error(e, &id))?;
            let mut stdout = tokio::io::stdout().compat_write();
            futures::io::copy(content, &mut stdout).await.report("writing content")?;
            futures::AsyncWriteExt::flush(&mut stdout).await.report("writing content")?;
            Ok(())
        },
        Command::Status => status(app).await,
    }
}

async fn run(app: &App, once: bool) -> Result<()> {
    let reconciler = app.reconciler().await?;
    if once {
        let report = reconciler.run_once().await.report("reconciling")?;
        println!(
            "fetched {} deleted {} malformed {} not deleted {}{}",
            report.fetched,
            report.deleted,
            report.malformed,
            report.not_deleted.len(),
            if report.batch_failed { " (batch failed)" } else { "" },
        );
        for failed in &report.not_deleted {
            println!("  {}: {}", failed.path, &*failed.cause);
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let handle = reconciler.spawn(cancel.clone());
    shutdown_signal().await;
    tracing::info!("shutting down");
    cancel.cancel();
    handle.await.report("reconciler task")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn upload(app: &App, book: NewBook, file: PathBuf) -> Result<()> {
    let stored = if file.as_os_str() == "-" {
        app.service.upload(book, None, tokio::io::stdin().compat()).await
    } else {
        let handle = tokio::fs::File::open(&file).await.report(&format!("opening {}", file.display()))?;
        let size = handle.metadata().await.ok().map(|m| m.len());
        app.service.upload(book, size, handle.compat()).await
    };
    let stored = stored.map_err(|e| library_error(e, &file.display()))?;
    print_book(&stored);
    Ok(())
}

async fn show(app: &App, args: ShowArgs) -> Result<()> {
    let books = match args {
        ShowArgs { id: Some(id), .. } => vec![app.service.get_by_id(id).await.map_err(|e| library_error(e, &id))?],
        ShowArgs { hash: Some(hash), .. } => {
            let hash = BookHash::from_str(&hash).map_err(|e| miette!("invalid hash {hash:?}: {}", &*e))?;
            app.service.get_by_hash(&hash).await.map_err(|e| library_error(e, &hash))?
        },
        ShowArgs { title: Some(title), owner: Some(owner), .. } => vec![
            app.service
                .get_by_title_and_user_id(&title, owner)
                .await
                .map_err(|e| library_error(e, &title))?,
        ],
        _ => return Err(miette!("give a book ID, --hash, or --title with --owner")),
    };
    books.iter().for_each(print_book);
    Ok(())
}

async fn status(app: &App) -> Result<()> {
    let stream = app.channel.stream_info(events::STREAM).await.report("reading stream state")?;
    println!(
        "stream {} ({}): {} queued, sequences {}..={}",
        stream.name,
        stream.subjects.join(", "),
        stream.messages,
        stream.first_sequence,
        stream.last_sequence,
    );
    let consumer = Consumer { stream: events::STREAM.to_string(), durable: events::DELETER.to_string() };
    match app.channel.consumer_info(&consumer).await {
        Ok(info) => println!(
            "consumer {}: cursor {}, {} pending, {} awaiting ack",
            info.durable, info.cursor, info.num_pending, info.num_ack_pending,
        ),
        Err(err) if matches!(&*err, EventsErrorKind::ConsumerNotFound(_)) => {
            println!("consumer {}: not created yet", events::DELETER);
        },
        Err(err) => return Err(miette!("reading consumer state: {err:?}")),
    }
    Ok(())
}

fn library_error(err: shelf_library::error::Error, key: &dyn std::fmt::Display) -> miette::Report {
    match &*err {
        LibraryErrorKind::NotFound => miette!("{key}: not found"),
        kind => miette!("{key}: {kind}"),
    }
}

fn print_book(book: &Book) {
    println!("{}\t{}\t{}\t{}\t{}\t{}", book.id, book.owner, book.uploaded_at, book.hash, book.path, book.title);
}
