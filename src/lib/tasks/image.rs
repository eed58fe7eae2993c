use super::types::{ImageRef, TaskError, TaskResult};

pub const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

impl ImageRef {
    /// Decomposes an image string such as `ghcr.io/acme/api:1.2` or
    /// `ubuntu@sha256:...` into registry, repository, tag and digest.
    pub fn parse(image: &str) -> TaskResult<Self> {
        let invalid =
            |reason: &str| TaskError::Validation(format!("invalid image {:?}: {}", image, reason));

        if image.is_empty() {
            return Err(invalid("empty reference"));
        }
        if image.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        let (name_and_tag, digest) = match image.split_once('@') {
            Some((name, digest)) => {
                if !valid_digest(digest) {
                    return Err(invalid("malformed digest"));
                }
                (name, Some(digest.to_string()))
            }
            None => (image, None),
        };

        // a colon after the last slash separates the tag, earlier ones belong to a registry port
        let last_segment = name_and_tag.rfind('/').map_or(0, |idx| idx + 1);
        let (name, tag) = match name_and_tag[last_segment..].rfind(':') {
            Some(idx) => {
                let split = last_segment + idx;
                (&name_and_tag[..split], Some(&name_and_tag[split + 1..]))
            }
            None => (name_and_tag, None),
        };

        if let Some(tag) = tag {
            if !valid_tag(tag) {
                return Err(invalid("malformed tag"));
            }
        }

        let (registry, remainder) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first, rest)
            }
            _ => (DEFAULT_REGISTRY, name),
        };

        if !remainder.split('/').all(valid_path_component) {
            return Err(invalid("malformed repository"));
        }

        let repository = if registry == DEFAULT_REGISTRY && !remainder.contains('/') {
            format!("library/{}", remainder)
        } else {
            remainder.to_string()
        };

        Ok(ImageRef {
            full_name: image.to_string(),
            registry: registry.to_string(),
            repository,
            tag: tag.unwrap_or(DEFAULT_TAG).to_string(),
            digest,
        })
    }

    /// Repository name as the runtime expects it, registry included unless it
    /// is the default one.
    pub fn canonical_name(&self) -> String {
        if self.registry == DEFAULT_REGISTRY {
            self.repository.clone()
        } else {
            format!("{}/{}", self.registry, self.repository)
        }
    }

    /// Pinned reference used when creating containers. A digest wins over the tag.
    pub fn reference(&self) -> String {
        match &self.digest {
            Some(digest) => format!("{}@{}", self.canonical_name(), digest),
            None => format!("{}:{}", self.canonical_name(), self.tag),
        }
    }
}

fn valid_path_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        && component.starts_with(|c: char| c.is_ascii_alphanumeric())
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c))
}

fn valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && algorithm
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                && hex.len() >= 32
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}
