//! The dependency-closure fetcher.
//!
//! Starting from one root package, crawls the upstream index breadth-first:
//! every node fetches its release list (and, in parallel, a cross-ecosystem
//! mapping lookup), pulls the pre-published metadata of the best wheel per
//! release, and enqueues the names it depends on. Nodes the index cannot
//! serve fall back to the mapping; nodes with neither go into an error bucket
//! for the operator to resolve. Each normalized name is crawled at most once.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use futures::join;
use pep440_rs::VersionSpecifiers;
use pep508_rs::Requirement;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::index::{MappingClient, PyPiClient, PyPiError, PyPiRelease};
use crate::markers::extract_extra;
use crate::types::{NormalizedPackageName, PackageName, RFC822ish};

/// Knobs for the crawl.
#[derive(Debug, Clone)]
pub struct ClosureOptions {
    /// Cap on releases fetched per package.
    pub max_versions: Option<usize>,
    /// Bound on concurrently in-flight nodes.
    pub concurrency: usize,
}

impl Default for ClosureOptions {
    fn default() -> Self {
        Self {
            max_versions: Some(3),
            concurrency: 50,
        }
    }
}

/// How a crawled node was resolved.
#[derive(Debug)]
pub enum Resolution {
    /// The index served releases and wheel metadata.
    Fetched {
        /// Releases matching the node's constraint, newest first.
        releases: Vec<PyPiRelease>,
        /// Names of unconditional dependencies, across all fetched releases.
        required: BTreeSet<String>,
        /// Names of optional dependencies, per extra.
        optional: BTreeMap<String, BTreeSet<String>>,
    },
    /// The index failed, but the external ecosystem carries the package
    /// under this name. Its dependency subtree belongs to that ecosystem and
    /// is not crawled.
    Mapped {
        /// The name in the external ecosystem.
        conda_name: String,
    },
}

/// A successfully resolved node.
#[derive(Debug)]
pub struct ResolvedPackage {
    /// Canonical package name.
    pub name: NormalizedPackageName,
    /// The constraint the node was crawled under (only the root carries
    /// one).
    pub constraint: Option<VersionSpecifiers>,
    /// The package that caused this node to be crawled; `None` for the root.
    pub required_by: Option<NormalizedPackageName>,
    /// The resolution.
    pub resolution: Resolution,
}

/// A node the operator has to resolve by hand.
#[derive(Debug)]
pub struct UnresolvedPackage {
    /// Canonical package name.
    pub name: NormalizedPackageName,
    /// The package that needed it.
    pub required_by: Option<NormalizedPackageName>,
    /// Why the crawl could not resolve it.
    pub error: String,
}

/// The complete crawl output.
#[derive(Debug, Default)]
pub struct ClosureResult {
    /// Resolved nodes, sorted by name.
    pub resolved: Vec<ResolvedPackage>,
    /// Unresolved nodes, sorted by name.
    pub unresolved: Vec<UnresolvedPackage>,
}

type QueueItem = (
    NormalizedPackageName,
    Option<VersionSpecifiers>,
    Option<NormalizedPackageName>,
);

/// Crawls the transitive dependency closure of `root`.
pub async fn fetch_closure(
    pypi: &PyPiClient,
    mapping: &MappingClient,
    root: NormalizedPackageName,
    constraint: Option<VersionSpecifiers>,
    options: &ClosureOptions,
) -> ClosureResult {
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut visited: HashSet<NormalizedPackageName> = HashSet::new();
    let mut queue: VecDeque<QueueItem> = VecDeque::new();
    let mut in_flight: JoinSet<(QueueItem, Result<NodeData, String>)> = JoinSet::new();
    let mut result = ClosureResult::default();

    visited.insert(root.clone());
    queue.push_back((root, constraint, None));

    loop {
        // Dispatch everything queued; the semaphore inside each task bounds
        // actual parallelism.
        while let Some(item) = queue.pop_front() {
            let pypi = pypi.clone();
            let mapping = mapping.clone();
            let semaphore = Arc::clone(&semaphore);
            let max_versions = options.max_versions;
            in_flight.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("the semaphore is never closed");
                let outcome = fetch_node(&pypi, &mapping, &item.0, item.1.as_ref(), max_versions)
                    .await;
                (item, outcome)
            });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let ((name, constraint, required_by), outcome) =
            joined.expect("closure tasks do not panic");

        match outcome {
            Ok(NodeData::Fetched {
                releases,
                required,
                optional,
            }) => {
                // First enqueue wins; later references to the same name are
                // dropped silently.
                for dep in required.iter().chain(optional.values().flatten()) {
                    let Ok(dep_name) = NormalizedPackageName::from_str(dep) else {
                        tracing::warn!("ignoring invalid dependency name '{dep}' of {name}");
                        continue;
                    };
                    if visited.insert(dep_name.clone()) {
                        queue.push_back((dep_name, None, Some(name.clone())));
                    }
                }
                result.resolved.push(ResolvedPackage {
                    name,
                    constraint,
                    required_by,
                    resolution: Resolution::Fetched {
                        releases,
                        required,
                        optional,
                    },
                });
            }
            Ok(NodeData::Mapped { conda_name }) => {
                result.resolved.push(ResolvedPackage {
                    name,
                    constraint,
                    required_by,
                    resolution: Resolution::Mapped { conda_name },
                });
            }
            Err(error) => {
                result.unresolved.push(UnresolvedPackage {
                    name,
                    required_by,
                    error,
                });
            }
        }
    }

    result.resolved.sort_by(|a, b| a.name.cmp(&b.name));
    result.unresolved.sort_by(|a, b| a.name.cmp(&b.name));
    result
}

enum NodeData {
    Fetched {
        releases: Vec<PyPiRelease>,
        required: BTreeSet<String>,
        optional: BTreeMap<String, BTreeSet<String>>,
    },
    Mapped {
        conda_name: String,
    },
}

async fn fetch_node(
    pypi: &PyPiClient,
    mapping: &MappingClient,
    name: &NormalizedPackageName,
    constraint: Option<&VersionSpecifiers>,
    max_versions: Option<usize>,
) -> Result<NodeData, String> {
    // The release list and the mapping lookup go out together; the mapping
    // is only consulted when the index path fails.
    let (releases, mapped) = join!(
        pypi.get_matching_releases(name, constraint, max_versions, false),
        mapping.lookup(name),
    );

    // Only releases carrying a pure wheel are usable for the crawl: a
    // platform-only package cannot be mirrored as one channel entry, so it
    // is deferred to the external ecosystem (or the operator) instead.
    let releases = releases.map(|releases| {
        releases
            .into_iter()
            .filter(|release| {
                release.wheels.iter().any(|wheel| {
                    wheel.filename.contains("py3-none-any")
                        || wheel.filename.contains("py2.py3-none-any")
                })
            })
            .collect::<Vec<_>>()
    });

    let failure = match releases {
        Ok(releases) if !releases.is_empty() => {
            match dependency_sets(pypi, &releases).await {
                Ok((required, optional)) => {
                    return Ok(NodeData::Fetched {
                        releases,
                        required,
                        optional,
                    })
                }
                Err(err) => err.to_string(),
            }
        }
        Ok(_) => format!("no releases with pure wheels match the constraint for '{name}'"),
        Err(err) => err.to_string(),
    };

    match mapped {
        Ok(Some(conda_name)) => Ok(NodeData::Mapped { conda_name }),
        _ => Err(failure),
    }
}

/// Collects the (required, optional-per-extra) dependency name sets across
/// the best wheel of every release.
async fn dependency_sets(
    pypi: &PyPiClient,
    releases: &[PyPiRelease],
) -> Result<(BTreeSet<String>, BTreeMap<String, BTreeSet<String>>), PyPiError> {
    let mut required = BTreeSet::new();
    let mut optional: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for release in releases {
        let Some(wheel) = release.best_wheel() else {
            continue;
        };
        let Some(metadata) = pypi.fetch_wheel_metadata(&wheel.url).await? else {
            // The index has not published metadata for this wheel; nothing to
            // learn without downloading the whole file.
            tracing::debug!("no pre-published metadata for {}", wheel.filename);
            continue;
        };
        let (release_required, release_optional) = dependency_sets_from_metadata(&metadata);
        required.extend(release_required);
        for (extra, names) in release_optional {
            optional.entry(extra).or_default().extend(names);
        }
    }

    Ok((required, optional))
}

/// Splits the `Requires-Dist` entries of a METADATA document into required
/// and per-extra optional dependency names (normalized).
fn dependency_sets_from_metadata(
    metadata: &[u8],
) -> (BTreeSet<String>, BTreeMap<String, BTreeSet<String>>) {
    let mut required = BTreeSet::new();
    let mut optional: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    let content = String::from_utf8_lossy(metadata);
    let Ok(mut parsed) = RFC822ish::from_str(&content) else {
        return (required, optional);
    };

    for requirement_str in parsed.take_all("Requires-Dist") {
        let requirement: Requirement = match requirement_str.parse() {
            Ok(requirement) => requirement,
            Err(err) => {
                tracing::warn!("ignoring Requires-Dist: {requirement_str}, failed to parse: {err}");
                continue;
            }
        };
        let Ok(name) = PackageName::from_str(&requirement.name) else {
            continue;
        };
        let name = NormalizedPackageName::from(name).to_string();

        match requirement.marker.as_ref().and_then(extract_extra) {
            Some((extra, _)) => {
                optional.entry(extra).or_default().insert(name);
            }
            None => {
                required.insert(name);
            }
        }
    }

    (required, optional)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dependency_sets_split_extras() {
        let metadata = b"Metadata-Version: 2.1\nName: app\nVersion: 1.0\nRequires-Dist: requests>=2.0\nRequires-Dist: Typing_Extensions; python_version < '3.11'\nRequires-Dist: pytest; extra == 'test'\nRequires-Dist: black; extra == 'dev' and python_version >= '3.8'\n";
        let (required, optional) = dependency_sets_from_metadata(metadata);

        assert_eq!(
            required,
            BTreeSet::from(["requests".to_owned(), "typing-extensions".to_owned()])
        );
        assert_eq!(optional["test"], BTreeSet::from(["pytest".to_owned()]));
        assert_eq!(optional["dev"], BTreeSet::from(["black".to_owned()]));
    }

    #[test]
    fn test_unparsable_requirements_are_skipped() {
        let metadata =
            b"Metadata-Version: 2.1\nName: app\nVersion: 1.0\nRequires-Dist: ???grim\n";
        let (required, optional) = dependency_sets_from_metadata(metadata);
        assert!(required.is_empty());
        assert!(optional.is_empty());
    }
}
