use std::{fs::File, io::Write as _, process::ExitCode};

use serde_json::{Value, json};
use tracing::{error, info};

use streampipe::common::AnyResult;
use streampipe::plugins;
use streampipe::session::Session;
use streampipe::stream::quality;

const USAGE: &str = "\
Usage: streampipe [OPTIONS] URL [STREAM]

Pipe a stream from URL to stdout. STREAM is a quality name, a comma
separated list of names, or best/worst (default: best).

Options:
  -o, --output FILE          Write the stream to FILE instead of stdout
  -j, --json                 Print the available streams as JSON and exit
      --plugins              Print the registered plugin names and exit
      --http-no-ssl-verify   Disable TLS certificate verification
      --OPTION[=VALUE]       Any session option, e.g. --http-proxy=URL,
                             --http-timeout=SECS, --hls-live-edge=N,
                             --dash-manifest-reload-attempts=N,
                             --stream-timeout=SECS
  -h, --help                 Show this help";

/// Flag prefixes forwarded verbatim as session options.
const OPTION_PREFIXES: &[&str] = &["http-", "hls-", "dash-", "stream-", "ffmpeg-", "rtmp-"];

struct Args {
    url: String,
    stream: String,
    output: Option<String>,
    json: bool,
    list_plugins: bool,
    options: Vec<(String, Value)>,
}

/// Parse a flag value: numbers and booleans keep their JSON type, anything
/// else stays a string.
fn option_value(raw: String) -> Value {
    match serde_json::from_str::<Value>(&raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
        _ => Value::String(raw),
    }
}

fn parse_args() -> Result<Args, String> {
    let mut url = None;
    let mut stream = None;
    let mut output = None;
    let mut json = false;
    let mut list_plugins = false;
    let mut options = Vec::new();

    let mut argv = std::env::args().skip(1);
    while let Some(arg) = argv.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with('-') => (f.to_string(), Some(v.to_string())),
            _ => (arg.clone(), None),
        };
        let mut value_for = |flag: &str| {
            inline
                .clone()
                .or_else(|| argv.next())
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match flag.as_str() {
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            "-o" | "--output" => output = Some(value_for(&flag)?),
            "-j" | "--json" => json = true,
            "--plugins" => list_plugins = true,
            "--http-no-ssl-verify" => {
                options.push(("http-ssl-verify".to_string(), Value::Bool(false)));
            }
            other if other.starts_with("--") => {
                let key = &other[2..];
                if !OPTION_PREFIXES.iter().any(|p| key.starts_with(p)) {
                    return Err(format!("Unknown option {other}"));
                }
                options.push((key.to_string(), option_value(value_for(&flag)?)));
            }
            other if other.starts_with('-') => {
                return Err(format!("Unknown option {other}"));
            }
            positional => {
                if url.is_none() {
                    url = Some(positional.to_string());
                } else if stream.is_none() {
                    stream = Some(positional.to_string());
                } else {
                    return Err(format!("Unexpected argument {positional}"));
                }
            }
        }
    }

    Ok(Args {
        url: url.unwrap_or_default(),
        stream: stream.unwrap_or_else(|| "best".to_string()),
        output,
        json,
        list_plugins,
        options,
    })
}

fn run(args: Args) -> AnyResult<()> {
    let mut session = Session::new()?;
    for (key, value) in &args.options {
        session.set_option(key, value.clone())?;
    }
    plugins::register_builtin(&mut session)?;

    if args.list_plugins {
        for name in session.plugin_names() {
            println!("{name}");
        }
        return Ok(());
    }
    if args.url.is_empty() {
        return Err("Missing URL argument".into());
    }

    let (plugin, resolved) = session.resolve_url(&args.url, true)?;
    info!("Found matching plugin {} for URL {}", plugin.name(), args.url);
    let streams = plugin.streams(&session, &resolved)?;
    if streams.is_empty() {
        return Err(format!("No playable streams found on {}", args.url).into());
    }

    if args.json {
        let mut entries = serde_json::Map::new();
        for (name, stream) in &streams {
            entries.insert(name.clone(), stream.to_json());
        }
        let doc = json!({
            "plugin": plugin.name(),
            "url": args.url,
            "streams": Value::Object(entries),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    let names: Vec<String> = streams.iter().map(|(name, _)| name.clone()).collect();
    let Some(selected) = quality::select_name(&names, &args.stream, &[]) else {
        return Err(format!(
            "The stream {} was not found; available streams: {}",
            args.stream,
            quality::sorted_names(&names).join(", ")
        )
        .into());
    };
    let stream = streams
        .iter()
        .find(|(name, _)| *name == selected)
        .map(|(_, stream)| stream)
        .ok_or("Selected stream disappeared")?;

    info!("Opening stream {selected} ({})", stream.stream_type());
    let mut handle = stream.open()?;
    let result = match &args.output {
        Some(path) => {
            let mut file = File::create(path)?;
            std::io::copy(&mut handle, &mut file).map(|_| ())
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            std::io::copy(&mut handle, &mut out)
                .and_then(|_| out.flush())
        }
    };
    handle.close();
    result?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}\n\n{USAGE}");
            return ExitCode::from(1);
        }
    };

    let worker = tokio::task::spawn_blocking(move || run(args));
    tokio::select! {
        result = worker => match result {
            Ok(Ok(())) => ExitCode::SUCCESS,
            Ok(Err(e)) => {
                error!("{e}");
                ExitCode::from(1)
            }
            Err(e) => {
                error!("Stream worker panicked: {e}");
                ExitCode::from(1)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            // The process exits before the blocking worker finishes; open
            // child processes receive SIGINT from the same terminal group.
            ExitCode::from(130)
        }
    }
}
