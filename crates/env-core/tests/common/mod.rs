//! Shared fixtures for env-core integration tests.
//!
//! `FAKE_PYTHON` is a POSIX shell script standing in for CPython. It answers
//! `--version`, creates environments with `-m venv`, and keeps an
//! environment's "installed" packages as `name==version` lines in
//! `<env>/installed.txt`, which `-m pip list|show|install|uninstall` read and
//! write. Package names trigger special behaviour:
//!
//! - `slow`: install sleeps for three seconds
//! - `broken`: install fails with a pip-style error
//! - an entry in `<env>/outdated.txt`: listed by `--outdated` with `99.0`
//! - `<env>/requires-<name>.txt`: the `Requires:` line of `pip show`
//!
//! `-m venv` on a target whose name starts with `broken` writes a partial
//! directory and fails.

#![allow(dead_code)]

use env_core::session::ManagerHandle;
use env_core::settings::{InstallerPreference, ManagerSettings};
use env_core::LogHandler;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const FAKE_PYTHON: &str = r#"#!/bin/sh
HERE=$(cd "$(dirname "$0")" && pwd)
ROOT=$(dirname "$HERE")
STATE="$ROOT/installed.txt"

if [ "$1" = "--version" ]; then
  echo "Python 3.11.7"
  exit 0
fi

if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
  shift 2
  for a in "$@"; do
    case "$a" in
      -*) ;;
      *) TARGET="$a" ;;
    esac
  done
  case "$(basename "$TARGET")" in
    broken*)
      mkdir -p "$TARGET"
      echo "Error: boom while creating $TARGET" >&2
      exit 1
      ;;
  esac
  mkdir -p "$TARGET/bin"
  printf 'home = %s\nversion = 3.11.7\n' "$HERE" > "$TARGET/pyvenv.cfg"
  cp "$0" "$TARGET/bin/python"
  chmod +x "$TARGET/bin/python"
  printf 'pip==24.0\n' > "$TARGET/installed.txt"
  exit 0
fi

if [ "$1" != "-m" ] || [ "$2" != "pip" ]; then
  echo "fake python: unsupported arguments: $*" >&2
  exit 2
fi

CMD="$3"
shift 3
touch "$STATE"

remove_pkg() {
  grep -v "^$1==" "$STATE" > "$STATE.tmp"
  mv "$STATE.tmp" "$STATE"
}

add_pkg() {
  spec="$1"
  name=${spec%%==*}
  case "$name" in
    slow) sleep 3 ;;
    broken)
      echo "ERROR: No matching distribution found for broken" >&2
      exit 1
      ;;
  esac
  if [ "$spec" = "$name" ]; then
    ver="$DEFAULT_VER"
  else
    ver=${spec#*==}
  fi
  remove_pkg "$name"
  echo "$name==$ver" >> "$STATE"
  if [ -f "$ROOT/outdated.txt" ] && [ "$DEFAULT_VER" = "99.0" ]; then
    grep -vx "$name" "$ROOT/outdated.txt" > "$ROOT/outdated.tmp"
    mv "$ROOT/outdated.tmp" "$ROOT/outdated.txt"
  fi
  echo "Successfully installed $name-$ver"
}

# Nested `-r` paths resolve against the including file.
install_reqs() {
  while IFS= read -r req || [ -n "$req" ]; do
    case "$req" in
      '-r '*)
        inc=${req#-r }
        case "$inc" in
          /*) ;;
          *) inc="$(dirname "$1")/$inc" ;;
        esac
        install_reqs "$inc"
        ;;
      ''|'#'*|-*) ;;
      *) add_pkg "$req" ;;
    esac
  done < "$1"
}

case "$CMD" in
  list)
    OUTDATED=0
    for a in "$@"; do
      [ "$a" = "--outdated" ] && OUTDATED=1
    done
    SEP=""
    printf '['
    while IFS= read -r line; do
      [ -z "$line" ] && continue
      name=${line%%==*}
      ver=${line#*==}
      if [ "$OUTDATED" = 1 ]; then
        grep -qx "$name" "$ROOT/outdated.txt" 2>/dev/null || continue
        printf '%s{"name": "%s", "version": "%s", "latest_version": "99.0"}' "$SEP" "$name" "$ver"
      else
        printf '%s{"name": "%s", "version": "%s"}' "$SEP" "$name" "$ver"
      fi
      SEP=", "
    done < "$STATE"
    printf ']\n'
    ;;
  show)
    for a in "$@"; do
      case "$a" in
        -*) ;;
        *) NAME="$a" ;;
      esac
    done
    line=$(grep "^$NAME==" "$STATE")
    if [ -z "$line" ]; then
      echo "WARNING: Package(s) not found: $NAME" >&2
      exit 1
    fi
    printf 'Name: %s\nVersion: %s\nSummary: Fake package\nLocation: %s/lib\nRequires: %s\nRequired-by:\n' \
      "$NAME" "${line#*==}" "$ROOT" "$(cat "$ROOT/requires-$NAME.txt" 2>/dev/null)"
    ;;
  install)
    DEFAULT_VER="1.0.0"
    for a in "$@"; do
      [ "$a" = "--upgrade" ] && DEFAULT_VER="99.0"
    done
    while [ $# -gt 0 ]; do
      case "$1" in
        -r)
          shift
          install_reqs "$1"
          ;;
        -*) ;;
        *) add_pkg "$1" ;;
      esac
      shift
    done
    ;;
  uninstall)
    for a in "$@"; do
      case "$a" in
        -*) ;;
        *)
          remove_pkg "$a"
          echo "Successfully uninstalled $a"
          ;;
      esac
    done
    ;;
  *)
    echo "fake pip: unsupported command $CMD" >&2
    exit 2
    ;;
esac
exit 0
"#;

/// A working directory plus a base interpreter outside of it.
pub struct Fixture {
    _temp: tempfile::TempDir,
    pub work: PathBuf,
    pub python: PathBuf,
}

impl Fixture {
    pub fn env_root(&self) -> PathBuf {
        self.work.join(".venvs")
    }

    pub fn env_dir(&self, name: &str) -> PathBuf {
        self.env_root().join(name)
    }

    pub fn python_selector(&self) -> Option<&str> {
        self.python.to_str()
    }
}

#[cfg(unix)]
pub fn write_executable(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(unix)]
pub fn fixture() -> Fixture {
    let temp = tempfile::tempdir().expect("Failed to create temp dir");
    let work = temp.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    let python = temp.path().join("base").join("bin").join("python3");
    write_executable(&python, FAKE_PYTHON);
    Fixture {
        _temp: temp,
        work,
        python,
    }
}

/// Settings that keep every tool call on the fake interpreter.
pub fn settings(index_url: &str) -> ManagerSettings {
    ManagerSettings {
        installer: InstallerPreference::Pip,
        index_url: index_url.to_string(),
        ..ManagerSettings::default()
    }
}

pub fn handle(fixture: &Fixture, index_url: &str) -> Arc<ManagerHandle> {
    Arc::new(
        ManagerHandle::new(&fixture.work, settings(index_url), Arc::new(LogHandler))
            .unwrap_or_else(|e| panic!("manager handle: {}", e)),
    )
}

/// An index URL nothing listens on.
pub async fn dead_index_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub const SEARCH_HTML: &str = r#"<html><body>
<a class="package-snippet" href="/project/requests/">
  <span class="package-snippet__name">requests</span>
  <span class="package-snippet__version">2.31.0</span>
  <p class="package-snippet__description">Python HTTP for Humans.</p>
</a>
<a class="package-snippet" href="/project/requests-mock/">
  <span class="package-snippet__name">requests-mock</span>
  <span class="package-snippet__version">1.11.0</span>
  <p class="package-snippet__description">Mock out responses from the requests package</p>
</a>
<a class="package-snippet" href="/project/httpx/">
  <span class="package-snippet__name">httpx</span>
  <span class="package-snippet__version">0.27.0</span>
  <p class="package-snippet__description">The next generation HTTP client.</p>
</a>
</body></html>"#;

pub const REQUESTS_JSON: &str = r#"{"info": {
  "name": "requests",
  "version": "2.31.0",
  "summary": "Python HTTP for Humans.",
  "home_page": "https://requests.readthedocs.io",
  "requires_dist": ["charset-normalizer<4,>=2", "idna<4,>=2.5", "PySocks!=1.5.7,>=1.5.6; extra == \"socks\""]
}}"#;

/// Minimal package index: search page, `requests` metadata, 404 otherwise.
pub async fn spawn_index() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let request = String::from_utf8_lossy(&buf);
                let path = request
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or("/")
                    .to_string();

                let (status, content_type, body) = if path.starts_with("/search/") {
                    ("200 OK", "text/html", SEARCH_HTML)
                } else if path == "/pypi/requests/json" {
                    ("200 OK", "application/json", REQUESTS_JSON)
                } else {
                    ("404 Not Found", "text/plain", "Not Found")
                };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    content_type,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}
