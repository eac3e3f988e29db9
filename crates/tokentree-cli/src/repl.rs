//! Line-oriented navigation shell over an exploration session.

use anyhow::{anyhow, Result};
use colored::Colorize;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokentree_core::{ExplorationSession, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Next,
    Prev,
    Down,
    Up,
    Goto(usize),
    Stats,
    Help,
    Quit,
}

enum ReplControl {
    Continue,
    Exit,
}

fn parse_command(line: &str) -> Result<Command> {
    let mut parts = line.split_whitespace();
    let head = parts.next().unwrap_or_default();
    let command = match head {
        "n" | "right" => Command::Next,
        "p" | "left" => Command::Prev,
        "d" | "down" => Command::Down,
        "u" | "up" => Command::Up,
        "s" | "stats" => Command::Stats,
        "h" | "help" | "?" => Command::Help,
        "q" | "quit" | "exit" => Command::Quit,
        "g" | "goto" => {
            let raw = parts
                .next()
                .ok_or_else(|| anyhow!("usage: g <index>"))?;
            let index = raw
                .parse()
                .map_err(|_| anyhow!("not an index: {raw}"))?;
            Command::Goto(index)
        }
        other => return Err(anyhow!("unknown command `{other}` (try `help`)")),
    };
    if parts.next().is_some() {
        return Err(anyhow!("unexpected arguments after `{head}`"));
    }
    Ok(command)
}

pub async fn run(session: &mut ExplorationSession) -> Result<()> {
    println!("{}", "Tokentree".green().bold());
    println!("Type `help` for commands. Type `q` to quit.\n");
    render(session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{}", "tokentree> ".cyan().bold());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command = match parse_command(line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{} {e}", "error:".red().bold());
                continue;
            }
        };
        match dispatch(session, command).await {
            ReplControl::Continue => {}
            ReplControl::Exit => break,
        }
    }

    Ok(())
}

async fn dispatch(session: &mut ExplorationSession, command: Command) -> ReplControl {
    let transition = match command {
        Command::Next => session.advance().await,
        Command::Prev => session.retreat().await,
        Command::Down => session.descend().await,
        Command::Up => session.ascend().await,
        Command::Goto(index) => session.select_index(index).await,
        Command::Stats => {
            print_stats(session);
            return ReplControl::Continue;
        }
        Command::Help => {
            print_help();
            return ReplControl::Continue;
        }
        Command::Quit => return ReplControl::Exit,
    };

    if transition == Transition::Blocked {
        println!("{}", "(no more tokens that way)".yellow());
    }
    render(session);
    ReplControl::Continue
}

fn render(session: &ExplorationSession) {
    let state = session.state();
    let k = session.config().page_width;
    let range = session.visible_range();

    println!(
        "{} depth {}  page {}  index {}/{}",
        "──".dimmed(),
        state.path.len(),
        state.page,
        state.index,
        session.loaded_width()
    );
    for (offset, node) in session.visible_nodes().iter().enumerate() {
        let index = range.start + offset;
        let line = format!(
            "{index:>5}  {:<24} p={:.4}  cum={:.6}",
            format!("{:?}", node.text),
            node.probability,
            node.cumulative_probability
        );
        if index == state.index {
            println!("{} {}", ">".cyan().bold(), line.cyan().bold());
        } else if index >= (state.page + 1) * k {
            println!("  {}", line.dimmed());
        } else {
            println!("  {line}");
        }
    }
    println!("{} {}\n", "text:".bold(), session.full_text());
}

fn print_stats(session: &ExplorationSession) {
    let stats = session.stats();
    println!("{}", "Fetch statistics".bold());
    println!("  root requests:   {}", stats.root_requests);
    println!("  expand requests: {}", stats.expand_requests);
    println!("  failures:        {}", stats.failures);
    println!("  deduplicated:    {}", stats.deduplicated);
    println!("  root width:      {}", session.root_width());
    println!("  prefetch tasks:  {}", session.pending_prefetch());
}

fn print_help() {
    println!("{}", "Commands".bold());
    println!("  n, right     next token");
    println!("  p, left      previous token");
    println!("  d, down      descend into the selected token");
    println!("  u, up        return to the parent level");
    println!("  g <index>    jump to an index on this level");
    println!("  s, stats     fetch statistics");
    println!("  q, quit      leave");
}
