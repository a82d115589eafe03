use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use curator::{
    runner::{Runner, RunnerOptions},
    types::CuratorError,
    utils::{read_user_agent, API_URL},
    wikipedia::WikipediaClient,
};
use log::{debug, info};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Builds a labeled image dataset from a Wikipedia category", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
    /// Directory for the hierarchy checkpoint, articles, images and dataset
    #[arg(short = 'o', long, global = true, default_value = "dataset/salads")]
    output_dir: PathBuf,
    /// Root category of the crawl
    #[arg(short = 'c', long, global = true, default_value = "Category:Salads")]
    category: String,
    /// Category nesting below the root that is still descended into
    #[arg(short = 'd', long, global = true, default_value_t = 3)]
    max_depth: usize,
    /// Substrings that prune a category and its subtree (repeatable)
    #[arg(long, global = true)]
    category_blacklist: Vec<String>,
    /// Substrings that reject a terminal before extraction (repeatable)
    #[arg(long, global = true)]
    article_blacklist: Vec<String>,
    /// Attempts per category listing or image download
    #[arg(short = 'r', long, global = true, default_value_t = 5)]
    retries: usize,
    /// Attempts per article attribute or image listing request
    #[arg(long, global = true, default_value_t = 3)]
    content_retries: usize,
    /// Seconds to wait between attempts
    #[arg(long, global = true, default_value_t = 120)]
    retry_delay: u64,
    /// Milliseconds to wait between consecutive requests
    #[arg(long, global = true, default_value_t = 1000)]
    request_delay: u64,
    /// File holding the user agent sent with every request
    #[arg(short = 'u', long, global = true, default_value = "USER_AGENT.txt")]
    user_agent_file: PathBuf,
    /// Ignore the hierarchy checkpoint and previously written articles
    #[arg(long, global = true)]
    no_resume: bool,
    /// Download images again even if a file for their id exists
    #[arg(long, global = true)]
    no_skip_downloaded: bool,
    /// Concurrent dataset workers
    #[arg(short = 'w', long, global = true, default_value_t = 4)]
    workers: usize,
    /// Longest image side in the dataset, 0 keeps the original size
    #[arg(long, global = true, default_value_t = 512)]
    max_image_side: u32,
    /// Share of each label held out for validation
    #[arg(short = 't', long, global = true, default_value_t = 0.1)]
    test_size: f64,
    /// Seed for the train/validation split
    #[arg(short = 's', long, global = true)]
    seed: Option<u64>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Crawl the category tree and extract article records
    Articles,
    /// Assign image ids and download the images
    Images,
    /// Build, label, split and save the dataset
    Dataset,
    /// Run every stage in order
    All,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    if let Ok(env) = std::env::var("RUST_LOG") {
        if env == "debug" {
            println!("{number:/>width$}", number = "", width = 20);
            println!("Debug mode enabled");
            println!("{number:/>width$}", number = "", width = 20);
            println!();
        }
    }

    debug!("Starting curator with {:#?}", args.clone());

    let mut builder = RunnerOptions::default_builder();
    builder
        .output_dir(args.output_dir)
        .category(args.category)
        .max_depth(args.max_depth)
        .retries(args.retries)
        .content_retries(args.content_retries)
        .retry_delay(args.retry_delay)
        .request_delay(args.request_delay)
        .resume(!args.no_resume)
        .skip_downloaded(!args.no_skip_downloaded)
        .workers(args.workers)
        .max_image_side(args.max_image_side)
        .test_size(args.test_size)
        .seed(args.seed);
    if !args.category_blacklist.is_empty() {
        builder.category_blacklist(args.category_blacklist);
    }
    if !args.article_blacklist.is_empty() {
        builder.article_blacklist(args.article_blacklist);
    }
    let options = builder.build()?;

    let user_agent = read_user_agent(&args.user_agent_file)?;
    let client = WikipediaClient::new(API_URL.as_str(), &user_agent)
        .context("could not build http client")?;
    let runner = Runner::new(options, client)?;

    let res = match args.command {
        Command::Articles => runner.run_articles().await.map(|r| format!("{:?}", r)),
        Command::Images => runner.run_images().await.map(|r| format!("{:?}", r)),
        Command::Dataset => runner.run_dataset().await.map(|r| format!("{:?}", r)),
        Command::All => runner.run_all().await.map(|r| format!("{:?}", r)),
    };

    match res {
        Ok(summary) => {
            info!("{}", summary);
            Ok(())
        }
        Err(e) => match e.downcast_ref::<CuratorError>() {
            Some(CuratorError::EarlyTermination) => {
                info!("interrupted, rerun the same command to resume");
                Ok(())
            }
            _ => Err(e),
        },
    }
}
