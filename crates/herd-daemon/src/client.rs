//! Thin client side of `herd call`.
//!
//! Sends one command to a running node and renders the tabular response.
//! Exit codes: 0 on success, 1 when the node reports a command-level error,
//! 2 when the node cannot be reached at all.

use std::process::ExitCode;

use serde_json::Value;

use herd_rpc::{RpcRequest, RpcResponse};

/// Parse a command-line argument: JSON when it looks like JSON, a plain
/// string otherwise, so `herd call group.create g1` just works.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Send one command and print the response.
pub async fn call(address: &str, method: &str, args: &[String]) -> ExitCode {
    let params: Vec<Value> = args.iter().map(|a| parse_arg(a)).collect();
    let request = RpcRequest {
        method: method.to_string(),
        params: Value::Array(params),
    };

    let url = format!("http://{address}/");
    let response = match reqwest::Client::new().post(&url).json(&request).send().await {
        Ok(response) => response,
        Err(err) => {
            eprintln!("cannot reach node at {address}: {err}");
            return ExitCode::from(2);
        }
    };
    let response: RpcResponse = match response.json().await {
        Ok(response) => response,
        Err(err) => {
            eprintln!("bad response from node at {address}: {err}");
            return ExitCode::from(2);
        }
    };

    render(&response);
    if response.error.is_some() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn render(response: &RpcResponse) {
    if let Some(error) = &response.error {
        eprintln!("error: {error}");
        return;
    }
    for set in &response.results {
        println!("{}", set.names.join("\t"));
        for row in &set.rows {
            let cells: Vec<String> = row.iter().map(render_cell).collect();
            println!("{}", cells.join("\t"));
        }
        println!();
    }
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arguments_parse_as_json_with_string_fallback() {
        assert_eq!(parse_arg("g1"), json!("g1"));
        assert_eq!(parse_arg("false"), json!(false));
        assert_eq!(parse_arg("42"), json!(42));
        assert_eq!(parse_arg("[1,2]"), json!([1, 2]));
    }
}
