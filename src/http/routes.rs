//! Ordered path patterns below `/{owner}/{repo}/`.
//!
//! The patterns are few and fixed, so they are matched by hand rather than
//! with a regex engine.

use axum::http::Method;

use crate::git::GitService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Rpc(GitService),
    InfoRefs,
    /// `HEAD`, alternates and other `objects/info/*` files.
    TextFile,
    InfoPacks,
    LooseObject,
    PackFile,
    IdxFile,
}

impl RouteKind {
    pub fn method(self) -> Method {
        match self {
            RouteKind::Rpc(_) => Method::POST,
            _ => Method::GET,
        }
    }

    /// Content-addressed files that never change once written. `info/packs`
    /// and the alternates files are rewritten in place, so they stay
    /// uncached.
    pub fn cache_forever(self) -> bool {
        matches!(
            self,
            RouteKind::LooseObject | RouteKind::PackFile | RouteKind::IdxFile
        )
    }

    pub fn content_type(self) -> &'static str {
        match self {
            RouteKind::TextFile => "text/plain",
            RouteKind::InfoPacks | RouteKind::InfoRefs => "text/plain; charset=utf-8",
            RouteKind::LooseObject => "application/x-git-loose-object",
            RouteKind::PackFile => "application/x-git-packed-objects",
            RouteKind::IdxFile => "application/x-git-packed-objects-toc",
            RouteKind::Rpc(GitService::ReceivePack) => "application/x-git-receive-pack-result",
            RouteKind::Rpc(_) => "application/x-git-upload-pack-result",
        }
    }
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn pack_name(file: &str, ext: &str) -> bool {
    file.strip_prefix("pack-")
        .and_then(|rest| rest.strip_suffix(ext))
        .is_some_and(|hash| is_hex(hash, 40))
}

/// Match the path below the repository against the known endpoints, in order.
/// `rest` has no leading slash.
pub fn match_route(rest: &str) -> Option<RouteKind> {
    let kind = match rest {
        "git-upload-pack" => RouteKind::Rpc(GitService::UploadPack),
        "git-receive-pack" => RouteKind::Rpc(GitService::ReceivePack),
        "info/refs" => RouteKind::InfoRefs,
        "HEAD" | "objects/info/alternates" | "objects/info/http-alternates" => RouteKind::TextFile,
        "objects/info/packs" => RouteKind::InfoPacks,
        _ => {
            let parts: Vec<&str> = rest.split('/').collect();
            match parts.as_slice() {
                ["objects", "info", file] if !file.is_empty() && *file != "." && *file != ".." => {
                    RouteKind::TextFile
                }
                ["objects", "pack", file] if pack_name(file, ".pack") => RouteKind::PackFile,
                ["objects", "pack", file] if pack_name(file, ".idx") => RouteKind::IdxFile,
                ["objects", dir, file] if is_hex(dir, 2) && is_hex(file, 38) => RouteKind::LooseObject,
                _ => return None,
            }
        }
    };
    Some(kind)
}
