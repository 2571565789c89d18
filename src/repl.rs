//! Interactive master prompt.

use colored::Colorize;
use drover_master::{SlaveProxy, SlaveRegistry, StatKind};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

const HELP_TEXT: &str = r#"
Available commands:
  help                        Show this help
  slaves                      List connected slaves
  use <hostname>              Address one slave explicitly
  wait                        Block until a slave connects, then use it

  cd [dir]                    Change the slave's directory (no dir: reset)
  run <command...>            Run a shell command, streaming its output
  all <command...>            Run a shell command on every slave
  env                         Print the slave's environment
  mkdir <dir>                 Create a directory (with parents)

  put <local> <remote>        Upload a file
  get <remote> <local>        Download a file
  rm <path>                   Delete a file or tree
  mv <src> <dest>             Rename
  cp <src> <dest>             Copy
  stat <path>                 What is this path?

  quit, exit                  Leave
"#;

pub async fn run(
    registry: SlaveRegistry,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "drover".bold().cyan());
    println!("Slaves connect to {}.", addr);
    println!("Type 'help' for available commands.\n");

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".drover_history"))
        .unwrap_or_else(|_| ".drover_history".into());
    let _ = rl.load_history(&history_path);

    let mut selected: Option<String> = None;

    loop {
        let prompt = match &selected {
            Some(host) => format!("{} ", format!("drover {}>", host).cyan()),
            None => format!("{} ", "drover>".cyan()),
        };
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match execute_repl_command(&registry, &mut selected, line).await {
                    Ok(Some(output)) => {
                        if !output.is_empty() {
                            println!("{}\n", output);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    println!("{}", "Bye.".dimmed());
    Ok(())
}

async fn execute_repl_command(
    registry: &SlaveRegistry,
    selected: &mut Option<String>,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };

    match cmd.to_lowercase().as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "slaves" => {
            let slaves = registry.all_slaves();
            if slaves.is_empty() {
                return Ok(Some("No slaves connected".yellow().to_string()));
            }
            let mut output = String::new();
            for slave in slaves {
                let marker = if selected.as_deref() == Some(slave.hostname()) {
                    "*"
                } else {
                    " "
                };
                output.push_str(&format!(
                    "{} {} (v{})\n",
                    marker,
                    slave.hostname().cyan(),
                    slave.version()
                ));
            }
            Ok(Some(output))
        }

        "use" => {
            if rest.is_empty() {
                return Ok(Some("Usage: use <hostname>".to_string()));
            }
            let found = registry
                .get_slave(false, |s| s.hostname() == rest, None)
                .await;
            match found {
                Some(slave) => {
                    *selected = Some(slave.hostname().to_string());
                    Ok(Some(format!("Using {}", slave.hostname().cyan())))
                }
                None => Ok(Some(format!("No slave named {}", rest.yellow()))),
            }
        }

        "wait" => {
            println!("Waiting for a slave...");
            match registry.get_slave(true, |_| true, None).await {
                Some(slave) => {
                    *selected = Some(slave.hostname().to_string());
                    Ok(Some(format!("Using {}", slave.hostname().cyan())))
                }
                None => Ok(Some("No slave appeared".yellow().to_string())),
            }
        }

        "cd" => {
            let slave = current_slave(registry, selected).await?;
            let dir = if rest.is_empty() { None } else { Some(rest) };
            let cwd = slave.set_cwd(dir).await?;
            Ok(Some(format!("now in {}", cwd)))
        }

        "run" | "!" => {
            if rest.is_empty() {
                return Ok(Some("Usage: run <command...>".to_string()));
            }
            let slave = current_slave(registry, selected).await?;
            let code = stream_command(&slave, rest, None).await?;
            Ok(Some(format!("$? = {}", code)))
        }

        "all" => {
            if rest.is_empty() {
                return Ok(Some("Usage: all <command...>".to_string()));
            }
            let slaves = registry.all_slaves();
            if slaves.is_empty() {
                return Ok(Some("No slaves connected".yellow().to_string()));
            }
            let mut handles = Vec::new();
            for slave in slaves {
                let command = rest.to_string();
                handles.push(tokio::spawn(async move {
                    let host = slave.hostname().to_string();
                    match stream_command(&slave, &command, Some(&host)).await {
                        Ok(code) => println!("{}: $? = {}", host.cyan(), code),
                        Err(e) => println!("{}: {}: {}", host.cyan(), "Error".red(), e),
                    }
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
            Ok(Some(String::new()))
        }

        "env" => {
            let slave = current_slave(registry, selected).await?;
            let env = slave.getenv().await?;
            let mut names: Vec<&String> = env.keys().collect();
            names.sort();
            let mut output = String::new();
            for name in names {
                output.push_str(&format!("{}={}\n", name.cyan(), env[name]));
            }
            Ok(Some(output))
        }

        "mkdir" => {
            if rest.is_empty() {
                return Ok(Some("Usage: mkdir <dir>".to_string()));
            }
            let slave = current_slave(registry, selected).await?;
            slave.mkdir(rest).await?;
            Ok(Some(format!("{} {}", "Created".green(), rest.cyan())))
        }

        "put" => {
            let (local, remote) = two_paths(rest, "put <local> <remote>")?;
            let slave = current_slave(registry, selected).await?;
            slave.send(std::path::Path::new(local), remote).await?;
            Ok(Some(format!(
                "{} {} -> {}",
                "Uploaded".green(),
                local,
                remote.cyan()
            )))
        }

        "get" => {
            let (remote, local) = two_paths(rest, "get <remote> <local>")?;
            let slave = current_slave(registry, selected).await?;
            slave.fetch(remote, std::path::Path::new(local)).await?;
            Ok(Some(format!(
                "{} {} -> {}",
                "Downloaded".green(),
                remote.cyan(),
                local
            )))
        }

        "rm" => {
            if rest.is_empty() {
                return Ok(Some("Usage: rm <path>".to_string()));
            }
            let slave = current_slave(registry, selected).await?;
            slave.remove(rest).await?;
            Ok(Some(format!("{} {}", "Removed".green(), rest.cyan())))
        }

        "mv" => {
            let (src, dest) = two_paths(rest, "mv <src> <dest>")?;
            let slave = current_slave(registry, selected).await?;
            slave.rename(src, dest).await?;
            Ok(Some(format!(
                "{} {} -> {}",
                "Renamed".green(),
                src,
                dest.cyan()
            )))
        }

        "cp" => {
            let (src, dest) = two_paths(rest, "cp <src> <dest>")?;
            let slave = current_slave(registry, selected).await?;
            slave.copy(src, dest).await?;
            Ok(Some(format!(
                "{} {} -> {}",
                "Copied".green(),
                src,
                dest.cyan()
            )))
        }

        "stat" => {
            if rest.is_empty() {
                return Ok(Some("Usage: stat <path>".to_string()));
            }
            let slave = current_slave(registry, selected).await?;
            let kind = match slave.stat(rest).await? {
                StatKind::Missing => "missing".yellow(),
                StatKind::Dir => "directory".cyan(),
                StatKind::File => "file".green(),
            };
            Ok(Some(format!("{}: {}", rest, kind)))
        }

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for help.",
            cmd
        ))),
    }
}

/// Picks the addressed slave, or any connected one when none is selected.
async fn current_slave(
    registry: &SlaveRegistry,
    selected: &Option<String>,
) -> Result<Arc<SlaveProxy>, Box<dyn std::error::Error>> {
    match selected {
        Some(host) => registry
            .get_slave(false, |s| s.hostname() == host, None)
            .await
            .ok_or_else(|| format!("slave {} is gone", host).into()),
        None => registry
            .get_slave(false, |_| true, None)
            .await
            .ok_or_else(|| "no slaves connected (try 'wait')".to_string().into()),
    }
}

/// Runs `command` through the slave's shell, printing output as it streams.
async fn stream_command(
    slave: &SlaveProxy,
    command: &str,
    prefix: Option<&str>,
) -> Result<i32, drover_master::OpError> {
    let args = vec!["sh".to_string(), "-c".to_string(), command.to_string()];

    let print_chunk = |data: &[u8]| {
        match prefix {
            Some(host) => print!("{}: {}", host.cyan(), String::from_utf8_lossy(data)),
            None => print!("{}", String::from_utf8_lossy(data)),
        }
        let _ = std::io::stdout().flush();
    };
    let mut on_stdout = print_chunk;
    let mut on_stderr = print_chunk;

    slave
        .execute(&args, Some(&mut on_stdout), Some(&mut on_stderr))
        .await
}

fn two_paths<'a>(
    rest: &'a str,
    usage: &str,
) -> Result<(&'a str, &'a str), Box<dyn std::error::Error>> {
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => Ok((a, b)),
        _ => Err(format!("Usage: {}", usage).into()),
    }
}
