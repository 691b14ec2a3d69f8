//! Fixed (surface, method) -> type lookup tables

use crate::types::EventType;

/// Map an upstream `/api/fs/{route}` name to an event type
pub fn web_type(route: &str) -> Option<EventType> {
    let event_type = match route {
        "copy" => EventType::Copy,
        "form" | "put" => EventType::Upload,
        "get" | "list" | "search" | "dirs" => EventType::Find,
        "mkdir" => EventType::Mkdir,
        "move" | "recursive_move" => EventType::Move,
        "remove" | "remove_empty_directory" => EventType::Remove,
        "rename" | "batch_rename" | "regex_rename" => EventType::Rename,
        _ => return None,
    };
    Some(event_type)
}

/// Map a WebDAV verb (upper case) to an event type
pub fn dav_type(verb: &str) -> Option<EventType> {
    let event_type = match verb {
        "COPY" => EventType::Copy,
        "MOVE" => EventType::Move,
        "MKCOL" => EventType::Mkdir,
        "DELETE" => EventType::Remove,
        "PUT" => EventType::Upload,
        "GET" | "PROPFIND" => EventType::Find,
        _ => return None,
    };
    Some(event_type)
}
