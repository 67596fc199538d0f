//! Minimal JSON-RPC command-line client for manually exercising a running
//! `rsbtd`. Not meant to replace a real control client, just enough to
//! poke at the daemon by hand: send a method name plus `key=value`
//! arguments, print back whatever JSON comes out.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rs_bt_engine::value::{self, Value, ValueMap};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "rsbtctl", version, about = "minimal JSON-RPC client for rsbtd")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 9091)]
    port: u16,

    /// RPC method name, e.g. session-get, torrent-get, torrent-start
    method: String,

    /// Arguments as key=value pairs. Values that parse as an integer or
    /// as `true`/`false` are sent typed; everything else is sent as a
    /// string. Repeat for a list: `ids=1 ids=2` becomes `"ids": [1, 2]`.
    #[arg(value_name = "key=value")]
    args: Vec<String>,

    /// Send raw JSON as the `arguments` object instead of key=value pairs.
    #[arg(long, conflicts_with = "args")]
    json: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let arguments = match &cli.json {
        Some(raw) => value::json_decode(raw)
            .context("parsing --json")?
            .as_map()
            .cloned()
            .unwrap_or_default(),
        None => parse_key_value_args(&cli.args)?,
    };

    let mut request = ValueMap::new();
    request.insert_str("method", Value::string(cli.method.clone()));
    request.insert_str("arguments", Value::Map(arguments));
    let body = value::json_encode(&Value::Map(request));

    let response = send_request(&cli.host, cli.port, &body)?;
    println!("{response}");
    Ok(())
}

fn parse_key_value_args(pairs: &[String]) -> Result<ValueMap> {
    let mut lists: std::collections::HashMap<String, Vec<Value>> = std::collections::HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for pair in pairs {
        let (key, raw) = pair.split_once('=').with_context(|| format!("argument `{pair}` is not key=value"))?;
        let value = parse_scalar(raw);
        if !lists.contains_key(key) {
            order.push(key.to_string());
        }
        lists.entry(key.to_string()).or_default().push(value);
    }

    let mut m = ValueMap::new();
    for key in order {
        let mut values = lists.remove(&key).unwrap_or_default();
        let value = if values.len() == 1 { values.remove(0) } else { Value::List(values) };
        m.insert_str(&key, value);
    }
    Ok(m)
}

fn parse_scalar(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        Value::Int(n)
    } else if raw == "true" {
        Value::Bool(true)
    } else if raw == "false" {
        Value::Bool(false)
    } else {
        Value::string(raw.to_string())
    }
}

fn send_request(host: &str, port: u16, body: &str) -> Result<String> {
    let mut stream = TcpStream::connect((host, port)).with_context(|| format!("connecting to {host}:{port}"))?;
    stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
    stream.set_write_timeout(Some(REQUEST_TIMEOUT))?;

    let request = format!(
        "POST /rpc HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).context("writing request")?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).context("reading response")?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);
    let offset = match resp.parse(&raw).context("parsing http response")? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => bail!("truncated http response from {host}:{port}"),
    };
    Ok(String::from_utf8_lossy(&raw[offset..]).into_owned())
}
