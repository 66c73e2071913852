//! pgsh: a line-oriented shell over [`pg_session::Session`].
//!
//! Lines starting with `\` are commands, dispatched on the second
//! character; anything else is buffered until it contains a `;` and
//! submitted as a simple query. All protocol concerns stay in the
//! session; this binary only reads lines and prints results.

use std::fs;
use std::io::{self, BufRead, Write};

use log::LevelFilter;

use pg_session::{
    DEFAULT_HOST, DEFAULT_PORT, DEFAULT_SERVICE, DEFAULT_SOCKET_PATH, DEFAULT_SOCKET_PREFIX,
    Session,
};

const HISTORY_FILE: &str = ".history";

fn main() -> io::Result<()> {
    // the session traces every protocol code at trace level; \e toggles
    // whether those reach the terminal
    env_logger::Builder::new()
        .filter_level(LevelFilter::Trace)
        .format_timestamp(None)
        .format_target(false)
        .init();
    log::set_max_level(LevelFilter::Error);

    let mut shell = Shell::new();
    shell.load_history();

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break; // EOF
        }
        line.push_str(input.trim_end_matches(['\n', '\r']));

        if !(line.starts_with('\\') || line.contains(';')) {
            line.push(' ');
            continue;
        }

        shell.history.push(line.clone());
        let keep_going = shell.dispatch(&line);
        line.clear();
        if !keep_going {
            break;
        }
    }

    shell.save_history();
    Ok(())
}

struct Shell {
    session: Session,
    max_rows: usize,
    echo_protocol: bool,
    history: Vec<String>,
}

impl Shell {
    fn new() -> Self {
        Shell {
            session: Session::new(),
            max_rows: 3,
            echo_protocol: false,
            history: Vec::new(),
        }
    }

    fn load_history(&mut self) {
        if let Ok(contents) = fs::read_to_string(HISTORY_FILE) {
            self.history.extend(contents.lines().map(String::from));
        }
    }

    fn save_history(&self) {
        let mut contents = self.history.join("\n");
        contents.push('\n');
        if let Err(e) = fs::write(HISTORY_FILE, contents) {
            println!("could not save history: {e}");
        }
    }

    /// Runs one submitted line; returns false when the shell should exit.
    fn dispatch(&mut self, line: &str) -> bool {
        match self.run(line) {
            Ok(keep_going) => keep_going,
            Err(e) => {
                println!("error: {e}");
                true
            }
        }
    }

    fn run(&mut self, line: &str) -> pg_session::Result<bool> {
        if !line.starts_with('\\') {
            self.query(line)?;
            return Ok(true);
        }

        let args: Vec<&str> = line.split_whitespace().collect();
        match line.chars().nth(1) {
            Some('c') => {
                let port = arg(&args, 1, DEFAULT_PORT);
                let path = arg(&args, 2, DEFAULT_SOCKET_PATH);
                let prefix = arg(&args, 3, DEFAULT_SOCKET_PREFIX);
                self.session.connect_local(port, path, prefix)?;
                println!("Local connection on {path}/{prefix}{port}");
            }
            Some('t') => {
                let host = arg(&args, 1, DEFAULT_HOST);
                let service = arg(&args, 2, DEFAULT_SERVICE);
                self.session.connect_tcp(host, service)?;
                println!("TCP connection to {host} on service or port {service}");
            }
            Some('s') => {
                let login = std::env::var("USER").unwrap_or_else(|_| "postgres".into());
                let database = arg(&args, 1, "");
                let user = arg(&args, 2, &login);
                self.session.startup(user, database)?;
                let shown = if database.is_empty() { "default" } else { database };
                println!("Connected to {shown} as user {user}");
                self.print_notifications();
            }
            Some('q') => {
                self.print_notifications();
                self.session.terminate()?;
                return Ok(false);
            }
            Some('g') => {
                if self.session.row_queue_len() == 0 {
                    println!("No more rows pending");
                } else {
                    self.print_rows(' ');
                }
            }
            Some('f') => {
                for (name, d) in self.session.field_descriptors() {
                    println!(
                        "{name}\t{}\t{}\t{}\t{}\t{}",
                        d.table_oid, d.column_no, d.data_type, d.type_modf, d.format_code
                    );
                }
            }
            Some('p') => {
                let mut names: Vec<_> = self.session.parameters().keys().collect();
                names.sort();
                for name in names {
                    println!("{name}: {}", self.session.get_parameter(name).unwrap_or(""));
                }
                self.print_notifications();
            }
            Some('m') => {
                match arg(&args, 1, "10").parse() {
                    Ok(n) => self.max_rows = n,
                    Err(_) => println!("Not a number"),
                }
                self.print_notifications();
            }
            Some('r') => {
                self.session.clear_row_queue();
                self.print_notifications();
            }
            Some('z') => self.session.cancel()?,
            Some('e') => {
                self.echo_protocol = !self.echo_protocol;
                log::set_max_level(if self.echo_protocol {
                    LevelFilter::Trace
                } else {
                    LevelFilter::Error
                });
                println!(
                    "Protocol echo is {}",
                    if self.echo_protocol { "on" } else { "off" }
                );
            }
            _ => println!("Unrecognized command"),
        }
        Ok(true)
    }

    fn query(&mut self, sql: &str) -> pg_session::Result<()> {
        self.session.query(sql)?;
        self.print_notifications();
        self.print_rows('\t');
        self.print_notifications();
        Ok(())
    }

    fn print_rows(&mut self, sep: char) {
        for _ in 0..self.max_rows {
            match self.session.get_strings() {
                Ok(row) => println!("{}", row.join(&sep.to_string())),
                Err(_) => break,
            }
        }
    }

    fn print_notifications(&mut self) {
        while let Ok(notification) = self.session.get_notification() {
            println!("{notification}");
        }
    }
}

fn arg<'a>(args: &[&'a str], pos: usize, default: &'a str) -> &'a str {
    match args.get(pos) {
        Some(value) if !value.is_empty() => value,
        _ => default,
    }
}
