/// Source namespace tag and the synthetic root segments that never carry a
/// policy of their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLayout {
    namespace: String,
    root_aliases: Vec<String>,
}

impl PathLayout {
    pub fn new(namespace: impl Into<String>, root_aliases: Vec<String>) -> Self {
        Self {
            namespace: namespace.into().trim_matches('/').to_string(),
            root_aliases,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Remote object key for an item whose container chain is `source_path`.
    pub fn remote_path(&self, source_path: &str) -> String {
        let source_path = source_path.trim_matches('/');
        if self.namespace.is_empty() {
            source_path.to_string()
        } else {
            format!("{}/{}", self.namespace, source_path)
        }
    }

    fn is_root_alias(&self, segment: &str) -> bool {
        self.root_aliases.iter().any(|alias| alias == segment)
    }

    /// Segments of `full_path` without the leading namespace tag and one
    /// root alias after it. Deeper segments are real folders even when they
    /// share a name with either.
    fn stripped<'a>(&self, full_path: &'a str) -> Vec<&'a str> {
        let segments: Vec<&str> = full_path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        let mut skip = 0;
        if !self.namespace.is_empty() && segments.first() == Some(&self.namespace.as_str()) {
            skip += 1;
        }
        if segments
            .get(skip)
            .is_some_and(|segment| self.is_root_alias(segment))
        {
            skip += 1;
        }
        segments[skip..].to_vec()
    }

    /// `full_path` with the leading namespace and root aliases removed.
    pub fn normalized(&self, full_path: &str) -> String {
        self.stripped(full_path).join("/")
    }

    /// Folder names above the item, shallowest first, with root aliases and
    /// the item's own name removed.
    pub fn ancestor_folders<'a>(&self, full_path: &'a str) -> Vec<&'a str> {
        let mut segments = self.stripped(full_path);
        segments.pop();
        segments
    }

    /// First folder below the root for a file stored at `remote_path`.
    pub fn top_level_folder<'a>(&self, remote_path: &'a str) -> Option<&'a str> {
        let segments = self.stripped(remote_path);
        if segments.len() < 2 {
            return None;
        }
        segments.first().copied()
    }
}

pub fn join_source_path(parent: &str, name: &str) -> String {
    let name = sanitize_segment(name);
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        name
    } else {
        format!("{parent}/{name}")
    }
}

pub fn sanitize_segment(name: &str) -> String {
    name.replace('/', "_")
}
