//! Line commands of the terminal client.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    New,
    Sessions,
    /// 1-based index into the session list.
    Select(usize),
    Rename(String),
    Upload(PathBuf),
    Docs,
    /// 1-based index into the active session's documents.
    Doc(usize),
    Say(String),
    History,
    Live,
    Status,
    Devices,
    Help,
    Quit,
    Empty,
    /// A known command with bad arguments; carries the usage line.
    Invalid(&'static str),
}

pub const HELP: &str = "\
Befehle:
  new               neue Sitzung
  sessions          Sitzungen anzeigen
  select <n>        Sitzung wählen
  rename <titel>    aktive Sitzung umbenennen
  upload <pfad>     Seite hochladen (Bild)
  docs              Lektionen anzeigen
  doc <n>           Lektion wählen
  say <text>        Nachricht an Mari (oder einfach Text eingeben)
  history           Verlauf der Lektion
  live              Sprachmodus an/aus
  status            aktueller Zustand
  devices           Audiogeräte anzeigen
  quit              beenden";

fn index(arg: &str) -> Option<usize> {
    arg.parse::<usize>().ok().filter(|n| *n >= 1)
}

pub fn parse(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word.to_lowercase().as_str() {
        "new" => Command::New,
        "sessions" => Command::Sessions,
        "select" => index(rest)
            .map(Command::Select)
            .unwrap_or(Command::Invalid("select <n>")),
        "rename" if rest.is_empty() => Command::Invalid("rename <titel>"),
        "rename" => Command::Rename(rest.to_string()),
        "upload" if rest.is_empty() => Command::Invalid("upload <pfad>"),
        "upload" => Command::Upload(PathBuf::from(rest)),
        "docs" => Command::Docs,
        "doc" => index(rest)
            .map(Command::Doc)
            .unwrap_or(Command::Invalid("doc <n>")),
        "say" => Command::Say(rest.to_string()),
        "history" => Command::History,
        "live" => Command::Live,
        "status" => Command::Status,
        "devices" => Command::Devices,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Say(line.to_string()),
    }
}

/// Media type for an uploaded page, from its file extension.
pub fn media_type_for(path: &std::path::Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}
