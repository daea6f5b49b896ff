//! ice9d - remote command execution daemon.
//!
//! Accepts TCP connections, spawns the requested process per connection,
//! relays its standard streams over a length-prefixed frame protocol and
//! reports the exit status. See the ice9-wire crate for the frame format.

mod buffer;
mod child;
mod conn;
mod pathsearch;
mod pipe;
mod server;

use anyhow::{anyhow, bail, Result};

fn main() -> Result<()> {
    let mut port = ice9_wire::DEFAULT_PORT;

    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        match a.as_str() {
            "-p" => {
                let v = args
                    .next()
                    .ok_or_else(|| anyhow!("option '-p' requires a parameter"))?;
                port = v.parse().map_err(|_| anyhow!("invalid port: {v}"))?;
            }
            "-h" | "--help" => {
                eprintln!("usage: ice9d [-p <port>]");
                return Ok(());
            }
            other => bail!("unrecognised option: {other}"),
        }
    }

    server::Server::bind(port)?.run()
}
