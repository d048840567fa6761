//! Source filters and destination naming.

use harbor_core::model::{Decoration, FilterKind, ReplicationFilter, ResourceType};
use harbor_core::pattern::Pattern;
use harbor_core::{Error, Result};

use crate::adapter::Resource;

/// Name of a resource type as written in filters.
pub fn resource_type_name(resource_type: ResourceType) -> &'static str {
    match resource_type {
        ResourceType::Image => "image",
        ResourceType::Chart => "chart",
        ResourceType::Artifact => "artifact",
    }
}

fn parse_resource_type(value: &str) -> Option<ResourceType> {
    match value {
        "image" => Some(ResourceType::Image),
        "chart" => Some(ResourceType::Chart),
        "artifact" => Some(ResourceType::Artifact),
        _ => None,
    }
}

/// Check every filter's pattern, rejecting duplicates of the same kind.
pub fn validate(filters: &[ReplicationFilter]) -> Result<()> {
    for (index, filter) in filters.iter().enumerate() {
        match filter.kind {
            FilterKind::Resource => {
                if parse_resource_type(&filter.value).is_none() {
                    return Err(Error::invalid(format!(
                        "unknown resource type {:?}",
                        filter.value
                    )));
                }
            }
            FilterKind::Name | FilterKind::Tag | FilterKind::Label => {
                Pattern::new(filter.value.as_str())?;
            }
        }
        if filter.kind != FilterKind::Label
            && filters[..index].iter().any(|f| f.kind == filter.kind)
        {
            return Err(Error::invalid(format!(
                "more than one {:?} filter",
                filter.kind
            )));
        }
    }
    Ok(())
}

/// Compiled form of a policy's filters.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    resource_type: Option<(ResourceType, Decoration)>,
    name: Option<(Pattern, Decoration)>,
    tag: Option<(Pattern, Decoration)>,
    labels: Vec<(String, Decoration)>,
}

fn selected(matched: bool, decoration: Decoration) -> bool {
    match decoration {
        Decoration::Matches => matched,
        Decoration::Excludes => !matched,
    }
}

impl Filters {
    /// Compile `filters`.
    pub fn new(filters: &[ReplicationFilter]) -> Result<Self> {
        validate(filters)?;
        let mut compiled = Filters::default();
        for filter in filters {
            match filter.kind {
                FilterKind::Resource => {
                    compiled.resource_type = parse_resource_type(&filter.value)
                        .map(|resource_type| (resource_type, filter.decoration));
                }
                FilterKind::Name => {
                    compiled.name = Some((Pattern::new(filter.value.as_str())?, filter.decoration));
                }
                FilterKind::Tag => {
                    compiled.tag = Some((Pattern::new(filter.value.as_str())?, filter.decoration));
                }
                FilterKind::Label => {
                    compiled.labels.push((filter.value.clone(), filter.decoration));
                }
            }
        }
        Ok(compiled)
    }

    /// Whether `repository` passes the name filter.
    pub fn repository(&self, repository: &str) -> bool {
        self.name
            .as_ref()
            .map_or(true, |(pattern, decoration)| {
                selected(pattern.matches(repository), *decoration)
            })
    }

    /// Tags passing the tag filter.
    pub fn tags<'t>(&self, tags: &'t [String]) -> Vec<&'t String> {
        tags.iter()
            .filter(|tag| {
                self.tag.as_ref().map_or(true, |(pattern, decoration)| {
                    selected(pattern.matches(tag), *decoration)
                })
            })
            .collect()
    }

    fn labels(&self, labels: &[String]) -> bool {
        self.labels.iter().all(|(label, decoration)| {
            selected(labels.iter().any(|l| l == label), *decoration)
        })
    }

    /// Narrow one resource: drop it, or keep it with only the passing tags.
    /// An untagged artifact passes only when no tag filter selects by match.
    pub fn apply_one(&self, mut resource: Resource) -> Option<Resource> {
        if let Some((resource_type, decoration)) = self.resource_type {
            if !selected(resource.resource_type == resource_type, decoration) {
                return None;
            }
        }
        if !self.repository(&resource.repository) || !self.labels(&resource.labels) {
            return None;
        }
        if resource.tags.is_empty() {
            let matches_filter = matches!(self.tag, Some((_, Decoration::Matches)));
            return (!matches_filter).then_some(resource);
        }
        let tags: Vec<String> = self.tags(&resource.tags).into_iter().cloned().collect();
        if tags.is_empty() {
            return None;
        }
        resource.tags = tags;
        Some(resource)
    }

    /// Narrow every resource.
    pub fn apply(&self, resources: Vec<Resource>) -> Vec<Resource> {
        resources
            .into_iter()
            .filter_map(|resource| self.apply_one(resource))
            .collect()
    }
}

/// Destination repository of `src` under `namespace`.
///
/// With no namespace the path is kept. A count of `-1` replaces the first
/// component (or prefixes a single-component path); a count of `n` drops
/// the first `n` components and prefixes the rest.
pub fn destination_repository(src: &str, namespace: Option<&str>, replace_count: i8) -> Result<String> {
    let namespace = match namespace.map(|ns| ns.trim_matches('/')) {
        Some(ns) if !ns.is_empty() => ns,
        _ => return Ok(src.to_owned()),
    };
    let components: Vec<&str> = src.split('/').collect();

    let rest = match replace_count {
        -1 => {
            if components.len() == 1 {
                components.as_slice()
            } else {
                &components[1..]
            }
        }
        n if n < -1 => {
            return Err(Error::invalid(format!("invalid replace count {n}")));
        }
        n => {
            let n = n as usize;
            if n > components.len() - 1 {
                return Err(Error::invalid(format!(
                    "cannot replace {n} components of {src:?}"
                )));
            }
            &components[n..]
        }
    };
    Ok(format!("{namespace}/{}", rest.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(kind: FilterKind, value: &str, decoration: Decoration) -> ReplicationFilter {
        ReplicationFilter {
            kind,
            value: value.to_owned(),
            decoration,
        }
    }

    #[test]
    fn tag_and_name_filters() {
        let filters = Filters::new(&[
            filter(FilterKind::Name, "library/**", Decoration::Matches),
            filter(FilterKind::Tag, "v1.*", Decoration::Matches),
        ])
        .unwrap();

        let resource = Resource::image("library/nginx", ["v1.0", "v2.0", "latest"]);
        let kept = filters.apply_one(resource).unwrap();
        assert_eq!(kept.tags, vec!["v1.0"]);

        let other = Resource::image("other/nginx", ["v1.0"]);
        assert!(filters.apply_one(other).is_none());

        let untagged = Resource::image("library/nginx", Vec::<String>::new());
        assert!(filters.apply_one(untagged).is_none());
    }

    #[test]
    fn excluding_filters() {
        let filters = Filters::new(&[
            filter(FilterKind::Tag, "*-rc*", Decoration::Excludes),
            filter(FilterKind::Label, "unstable", Decoration::Excludes),
        ])
        .unwrap();

        let resource = Resource::image("p/app", ["1.0", "1.1-rc1"]);
        assert_eq!(filters.apply_one(resource).unwrap().tags, vec!["1.0"]);

        let untagged = Resource::image("p/app", Vec::<String>::new());
        assert!(filters.apply_one(untagged).is_some());

        let mut labelled = Resource::image("p/app", ["1.0"]);
        labelled.labels.push("unstable".into());
        assert!(filters.apply_one(labelled).is_none());
    }

    #[test]
    fn resource_type_filter() {
        let filters = Filters::new(&[filter(FilterKind::Resource, "chart", Decoration::Matches)]).unwrap();
        assert!(filters.apply_one(Resource::image("p/app", ["1"])).is_none());

        let err = validate(&[filter(FilterKind::Resource, "vm", Decoration::Matches)]).unwrap_err();
        assert_eq!(err.kind(), harbor_core::ErrorKind::Invalid);
    }

    #[test]
    fn duplicate_filters_are_rejected() {
        let filters = [
            filter(FilterKind::Name, "a/**", Decoration::Matches),
            filter(FilterKind::Name, "b/**", Decoration::Matches),
        ];
        assert!(validate(&filters).is_err());
    }

    #[test]
    fn destination_naming() {
        assert_eq!(destination_repository("a/b/c", None, -1).unwrap(), "a/b/c");
        assert_eq!(destination_repository("a/b/c", Some(""), 2).unwrap(), "a/b/c");
        assert_eq!(destination_repository("a/b/c", Some("ns"), -1).unwrap(), "ns/b/c");
        assert_eq!(destination_repository("nginx", Some("ns"), -1).unwrap(), "ns/nginx");
        assert_eq!(destination_repository("a/b/c", Some("ns"), 0).unwrap(), "ns/a/b/c");
        assert_eq!(destination_repository("a/b/c", Some("ns"), 1).unwrap(), "ns/b/c");
        assert_eq!(destination_repository("a/b/c", Some("ns"), 2).unwrap(), "ns/c");
        assert!(destination_repository("a/b/c", Some("ns"), 3).is_err());
    }
}
