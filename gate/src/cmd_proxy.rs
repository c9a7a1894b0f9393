//! Client/server cmd id translation
//!
//! Some client builds number their messages differently from the workers.
//! The table is a CSV of `name,client_cmd_id,server_cmd_id`; a header line
//! and `#` comments are skipped. Ids missing from the table pass unchanged.

use crate::error::GateError;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default, Clone)]
pub struct CmdProxy {
    client_to_server: HashMap<u16, u16>,
    server_to_client: HashMap<u16, u16>,
    names: HashMap<u16, String>,
}

impl CmdProxy {
    pub fn load(path: &Path) -> Result<Self, GateError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GateError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, GateError> {
        let mut proxy = Self::default();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 3 {
                return Err(GateError::Config(format!(
                    "cmd map line {}: expected 3 fields, got {}",
                    line_no + 1,
                    fields.len()
                )));
            }

            let (client, server) = match (fields[1].parse::<u16>(), fields[2].parse::<u16>()) {
                (Ok(c), Ok(s)) => (c, s),
                // header row
                _ if line_no == 0 => continue,
                _ => {
                    return Err(GateError::Config(format!(
                        "cmd map line {}: bad cmd id",
                        line_no + 1
                    )))
                }
            };

            proxy.client_to_server.insert(client, server);
            proxy.server_to_client.insert(server, client);
            proxy.names.insert(server, fields[0].to_string());
        }
        Ok(proxy)
    }

    pub fn to_server(&self, client_cmd: u16) -> u16 {
        self.client_to_server.get(&client_cmd).copied().unwrap_or(client_cmd)
    }

    pub fn to_client(&self, server_cmd: u16) -> u16 {
        self.server_to_client.get(&server_cmd).copied().unwrap_or(server_cmd)
    }

    pub fn name(&self, server_cmd: u16) -> Option<&str> {
        self.names.get(&server_cmd).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.client_to_server.len()
    }

    pub fn is_empty(&self) -> bool {
        self.client_to_server.is_empty()
    }
}
