use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use fixloop::config::Config;
use fixloop::llm::Message;
use fixloop::repair::transcript::{self, Section};
use fixloop::{stage_upload, Analyst, LoopState, RepairReport};

#[derive(Parser)]
#[command(name = "fixloop")]
#[command(about = "Ask questions about your data files. The model writes Python, fixloop runs it and feeds errors back until it works.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a single question and print the answer
    Ask {
        question: String,
        /// Uploaded file to analyze
        #[arg(short, long)]
        file: Option<String>,
        /// Model to use
        #[arg(short, long)]
        model: Option<String>,
        /// OpenAI-compatible API base URL (requires --api-key)
        #[arg(long, requires = "api_key")]
        api_base: Option<String>,
        /// API key for --api-base
        #[arg(long, requires = "api_base")]
        api_key: Option<String>,
    },
    /// Start interactive chat
    Chat {
        /// Uploaded file to analyze
        #[arg(short, long)]
        file: Option<String>,
        /// Model to use
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Copy a file into the upload directory
    Upload { path: PathBuf },
    /// Show configuration
    Config,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(model: Option<String>) -> Config {
    let mut cfg = Config::load();
    if let Some(model) = model {
        cfg.llm.model = model;
    }
    cfg
}

fn print_report(report: &RepairReport) {
    for section in transcript::sections(&report.transcript) {
        match section {
            Section::Narrative(text) => println!("{}", text),
            Section::Results(body) => println!("{}", body.green()),
            Section::Error(body) => println!("{}", body.red()),
        }
        println!();
    }
    let status = match report.state {
        LoopState::Succeeded => "ok".green(),
        _ => "gave up".red(),
    };
    println!(
        "{}",
        format!(
            "[{} | {} attempt(s), {} correction(s)]",
            status,
            report.attempts.len(),
            report.provider_calls
        )
        .dimmed()
    );
}

fn run_ask(
    question: &str,
    file: Option<String>,
    model: Option<String>,
    api_base: Option<String>,
    api_key: Option<String>,
) -> bool {
    let mut cfg = load_config(model);
    cfg.llm = cfg.llm.with_custom_api(api_base, api_key);
    let analyst = Analyst::from_config(cfg);

    eprint!("{}", "[thinking...]".dimmed());
    let result = analyst.respond(&[Message::user(question)], file.as_deref());
    eprint!("\r{}\r", " ".repeat(20));

    match result {
        Ok(report) => {
            print_report(&report);
            report.state == LoopState::Succeeded
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            false
        }
    }
}

fn run_chat(file: Option<String>, model: Option<String>) {
    let cfg = load_config(model);

    println!("{}", "fixloop v0.1.0".bold());
    println!("Model: {}", cfg.llm.model.green());
    if let Some(ref f) = file {
        println!("File: {}", f.cyan());
    }
    println!("Type {} to exit.\n", "Ctrl+D".dimmed());

    let analyst = Analyst::from_config(cfg);
    let mut history: Vec<Message> = Vec::new();

    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("{} failed to initialize readline: {}", "Error:".red(), e);
            return;
        }
    };

    loop {
        let readline = rl.readline(&format!("{} ", "you>".blue().bold()));
        match readline {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);

                history.push(Message::user(input));
                let start = std::time::Instant::now();
                eprint!("{}", "[thinking...]".dimmed());
                let result = analyst.respond(&history, file.as_deref());
                eprint!("\r{}\r", " ".repeat(20));

                match result {
                    Ok(report) => {
                        println!("{}", "bot>".green().bold());
                        print_report(&report);
                        history.push(Message::assistant(&report.transcript));
                    }
                    Err(e) => {
                        eprintln!("{} {}", "Error:".red().bold(), e);
                        // Drop the unanswered turn so the next one starts clean.
                        history.pop();
                    }
                }
                let elapsed = start.elapsed();
                println!("{}", format!("({:.1}s)", elapsed.as_secs_f64()).dimmed());
                println!();
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("Use Ctrl+D to exit.");
            }
            Err(rustyline::error::ReadlineError::Eof) => {
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {}", err);
                break;
            }
        }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ask {
            question,
            file,
            model,
            api_base,
            api_key,
        } => {
            if !run_ask(&question, file, model, api_base, api_key) {
                std::process::exit(1);
            }
        }
        Commands::Chat { file, model } => run_chat(file, model),
        Commands::Upload { path } => {
            let root = Config::load().sandbox.upload_root();
            match stage_upload(&root, &path) {
                Ok(staged) => println!(
                    "Uploaded {} ({} bytes) to {}",
                    staged.filename.cyan(),
                    staged.size,
                    staged.path.display()
                ),
                Err(e) => {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Config => {
            let config = Config::load();
            println!("{}", "Current configuration:".bold());
            println!();
            match config.to_toml() {
                Ok(s) => println!("{}", s),
                Err(e) => eprintln!("Error serializing config: {}", e),
            }
        }
    }
}
