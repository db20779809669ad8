use std::collections::HashMap;

use serde::Serialize;

/// The three canonical tag shapes a registry tag can take. Modeled as a sum type rather
/// than inferred ad hoc, per the "tag shapes → explicit matcher type"
/// design note — the matcher picks a rule, it never does a substring
/// `contains`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagShape {
    /// `507f1f77bcf86cd799439011`
    BareObjectId(String),
    /// `507f1f77bcf86cd799439011-v2`
    ObjectIdPrefixed { object_id: String, suffix: String },
    /// `507f1f77bcf86cd799439011-v2-1699999999_ab12cd`
    ModelSlug {
        object_id: String,
        version_suffix: String,
        timestamp_uid: String,
    },
}

fn is_hex24(s: &str) -> bool {
    s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit())
}

impl TagShape {
    /// Parses a registry tag into its canonical shape. Falls back to
    /// `None` for tags that match none of the three shapes (e.g. `latest`,
    /// `buildcache`), which callers must treat as unresolvable.
    pub fn parse(tag: &str) -> Option<TagShape> {
        if is_hex24(tag) {
            return Some(TagShape::BareObjectId(tag.to_string()));
        }
        let mut parts = tag.splitn(3, '-');
        let first = parts.next()?;
        if !is_hex24(first) {
            return None;
        }
        let rest: Vec<&str> = tag[first.len() + 1..].splitn(2, '-').collect();
        match rest.len() {
            1 if !rest[0].is_empty() => Some(TagShape::ObjectIdPrefixed {
                object_id: first.to_string(),
                suffix: rest[0].to_string(),
            }),
            2 => Some(TagShape::ModelSlug {
                object_id: first.to_string(),
                version_suffix: rest[0].to_string(),
                timestamp_uid: rest[1].to_string(),
            }),
            _ => None,
        }
    }

    pub fn object_id(&self) -> &str {
        match self {
            TagShape::BareObjectId(id) => id,
            TagShape::ObjectIdPrefixed { object_id, .. } => object_id,
            TagShape::ModelSlug { object_id, .. } => object_id,
        }
    }
}

/// Matches an archived ObjectID against a registry tag using the rule for
/// its shape: bare IDs match by equality, `<id>-<suffix>` tags match by a
/// dash-delimited prefix, and model slugs match by full equality against
/// the stored slug. Never a raw substring match — an ObjectID can appear
/// embedded in an unrelated longer tag.
pub fn id_matches_tag(archived_id: &str, tag: &str) -> bool {
    if !is_hex24(archived_id) {
        return false;
    }
    tag == archived_id || tag.starts_with(&format!("{archived_id}-"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecordType {
    Environment,
    Revision,
    Model,
    Version,
}

#[derive(Debug, Clone)]
pub struct ResolvedMatch {
    pub tag: String,
    pub object_id: String,
    pub record_type: RecordType,
}

/// A known revision belonging to an environment, used to narrow an
/// environment-ID match down to the specific revision it actually refers to.
pub struct RevisionInfo {
    pub revision_id: String,
    pub tag_suffix: Option<String>,
}

/// A known model version with its stored slug image tag, used to resolve a
/// model-ID match down to the specific version by slug equality.
pub struct VersionInfo {
    pub version_id: String,
    pub slug_tag: String,
}

/// Resolves every registry tag against a set of archived environment and
/// model ObjectIDs, narrowing environment matches to revisions and model
/// matches to versions wherever the narrower record is known. This is what
/// makes the downstream "IDs with tags" count 1:1 with revisions/versions
/// rather than with their parents.
pub fn resolve_matches(
    tags: &[String],
    archived_environment_ids: &[String],
    environment_revisions: &HashMap<String, Vec<RevisionInfo>>,
    archived_model_ids: &[String],
    model_versions: &HashMap<String, Vec<VersionInfo>>,
) -> Vec<ResolvedMatch> {
    let mut matches = Vec::new();

    for tag in tags {
        for env_id in archived_environment_ids {
            if !id_matches_tag(env_id, tag) {
                continue;
            }
            let narrowed = environment_revisions.get(env_id).and_then(|revisions| {
                revisions.iter().find(|r| {
                    r.tag_suffix
                        .as_ref()
                        .map(|suffix| tag == &format!("{env_id}-{suffix}"))
                        .unwrap_or(false)
                })
            });
            match narrowed {
                Some(revision) => matches.push(ResolvedMatch {
                    tag: tag.clone(),
                    object_id: revision.revision_id.clone(),
                    record_type: RecordType::Revision,
                }),
                None => matches.push(ResolvedMatch {
                    tag: tag.clone(),
                    object_id: env_id.clone(),
                    record_type: RecordType::Environment,
                }),
            }
        }

        for model_id in archived_model_ids {
            if !id_matches_tag(model_id, tag) {
                continue;
            }
            let narrowed = model_versions
                .get(model_id)
                .and_then(|versions| versions.iter().find(|v| tag == &v.slug_tag || tag.starts_with(&format!("{}-", v.slug_tag))));
            match narrowed {
                Some(version) => matches.push(ResolvedMatch {
                    tag: tag.clone(),
                    object_id: version.version_id.clone(),
                    record_type: RecordType::Version,
                }),
                None => matches.push(ResolvedMatch {
                    tag: tag.clone(),
                    object_id: model_id.clone(),
                    record_type: RecordType::Model,
                }),
            }
        }
    }

    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_object_id() {
        let shape = TagShape::parse("507f1f77bcf86cd799439011").unwrap();
        assert_eq!(shape, TagShape::BareObjectId("507f1f77bcf86cd799439011".into()));
    }

    #[test]
    fn parses_object_id_prefixed() {
        let shape = TagShape::parse("507f1f77bcf86cd799439011-v2").unwrap();
        assert_eq!(
            shape,
            TagShape::ObjectIdPrefixed {
                object_id: "507f1f77bcf86cd799439011".into(),
                suffix: "v2".into(),
            }
        );
    }

    #[test]
    fn parses_model_slug() {
        let shape = TagShape::parse("507f1f77bcf86cd799439011-v2-1699999999_ab12cd").unwrap();
        assert_eq!(
            shape,
            TagShape::ModelSlug {
                object_id: "507f1f77bcf86cd799439011".into(),
                version_suffix: "v2".into(),
                timestamp_uid: "1699999999_ab12cd".into(),
            }
        );
    }

    #[test]
    fn object_id_prefix_matches_dash_delimited_suffix_only() {
        let archived = "507f1f77bcf86cd799439011";
        let tags = vec![
            "507f1f77bcf86cd799439011-v1".to_string(),
            "507f1f77bcf86cd799439011x".to_string(),
            "othertag".to_string(),
        ];
        let matched: Vec<&String> = tags.iter().filter(|t| id_matches_tag(archived, t)).collect();
        assert_eq!(matched, vec![&"507f1f77bcf86cd799439011-v1".to_string()]);
    }

    #[test]
    fn never_substring_matches_embedded_object_id() {
        let archived = "507f1f77bcf86cd799439011";
        assert!(!id_matches_tag(archived, "prefix-507f1f77bcf86cd799439011-suffix"));
    }

    #[test]
    fn model_slug_resolution_narrows_to_version_id() {
        let mut versions = HashMap::new();
        versions.insert(
            "abc000000000000000000001".to_string(),
            vec![VersionInfo {
                version_id: "def000000000000000000002".to_string(),
                slug_tag: "abc000000000000000000001-v3".to_string(),
            }],
        );
        let tags = vec!["abc000000000000000000001-v3-1699999999_uid12".to_string()];
        let matches = resolve_matches(&tags, &[], &HashMap::new(), &["abc000000000000000000001".to_string()], &versions);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].object_id, "def000000000000000000002");
        assert_eq!(matches[0].record_type, RecordType::Version);
    }

    #[test]
    fn environment_match_narrows_to_revision_when_known() {
        let mut revisions = HashMap::new();
        revisions.insert(
            "507f1f77bcf86cd799439011".to_string(),
            vec![RevisionInfo {
                revision_id: "rev00000000000000000001".to_string(),
                tag_suffix: Some("v2".to_string()),
            }],
        );
        let tags = vec!["507f1f77bcf86cd799439011-v2".to_string()];
        let matches = resolve_matches(
            &tags,
            &["507f1f77bcf86cd799439011".to_string()],
            &revisions,
            &[],
            &HashMap::new(),
        );
        assert_eq!(matches[0].object_id, "rev00000000000000000001");
        assert_eq!(matches[0].record_type, RecordType::Revision);
    }
}
