//! Loading the desired state from YAML configuration

mod parser;
mod validation;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use glob::glob;

use crate::{
    grants::{Grant, Target},
    logging::debug,
    policy::{PolicyConfig, RulesetMap},
    ReconcileError,
};

pub use parser::{AssignmentYaml, ConfigDoc};

/// Everything configuration asks for, ready to plan against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    /// Every declared grant, with its target fully expanded
    pub grants: Vec<Grant>,
    /// Targets under management. Existing grants are only read (and so only
    /// ever deleted) at these.
    pub managed_targets: BTreeSet<Target>,
    /// Rulesets by name
    pub rulesets: RulesetMap,
    /// Which rulesets apply where
    pub policies: PolicyConfig,
}

impl DesiredState {
    /// Check the state for problems, reporting all of them at once
    pub fn validate(&self) -> Result<()> {
        let errors = validation::validate(self);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReconcileError::Config(errors).into())
        }
    }
}

/// Load configuration from a single file, or from every `.yaml`/`.yml` file
/// under a directory.
pub fn load<P: AsRef<Path>>(path: P) -> Result<DesiredState> {
    let path = path.as_ref();
    let files = if path.is_dir() {
        get_config_paths(path)?
    } else {
        vec![path.to_owned()]
    };

    let mut docs = Vec::new();
    for file in files {
        let contents = std::fs::read_to_string(&file)
            .context(format!("problem reading {}", file.display()))?;
        let parsed =
            parser::parse(&contents).context(format!("problem parsing {}", file.display()))?;
        debug!("read {} documents from {}", parsed.len(), file.display());
        docs.extend(parsed);
    }

    from_docs(docs)
}

/// Build and validate the desired state from parsed documents
pub fn from_docs(docs: Vec<ConfigDoc>) -> Result<DesiredState> {
    let (state, mut errors) = parser::materialize(docs);
    errors.extend(validation::validate(&state));
    if !errors.is_empty() {
        return Err(ReconcileError::Config(errors).into());
    }
    debug!(
        "configuration declares {} grants across {} targets",
        state.grants.len(),
        state.managed_targets.len()
    );
    Ok(state)
}

/// Get the paths of all config files under a directory, in a stable order
fn get_config_paths(root: &Path) -> Result<Vec<PathBuf>> {
    let paths = glob(format!("{}/**/*.y*ml", root.to_string_lossy()).as_str())
        .context("trouble generating config file paths")?;
    let mut res = paths
        .collect::<Result<Vec<_>, _>>()
        .context("trouble reading config file paths")?;
    res.sort();
    Ok(res)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use uuid::Uuid;

    use super::*;
    use crate::grants::{GrantKind, PrincipalKind};

    const GROUPS: &str = r#"
groups:
  - name: grp-admins
    eligible:
      - role: member
        principal: alice@contoso.com
        principalType: User
"#;

    const SUBSCRIPTIONS: &str = r#"
rulesets:
  - name: short
    rules:
      - ruleId: Expiration_Admin_Eligibility
        patch:
          maximumDuration: P30D
policies:
  default: [short]
subscriptions:
  - id: sub1
    eligible:
      - role: Reader
        principal: grp-a
        principalType: Group
        end: "2030-01-01T00:00:00Z"
    resourceGroups:
      - name: rg1
"#;

    #[test]
    fn directories_are_merged() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("pimsync-config-{}", Uuid::new_v4()));
        fs::create_dir_all(dir.join("nested"))?;
        fs::write(dir.join("groups.yaml"), GROUPS)?;
        fs::write(dir.join("nested").join("subs.yml"), SUBSCRIPTIONS)?;
        fs::write(dir.join("notes.txt"), "not config")?;

        let state = load(&dir)?;
        fs::remove_dir_all(&dir)?;

        assert_eq!(state.grants.len(), 2);
        assert_eq!(
            state.managed_targets,
            BTreeSet::from([
                Target::group("grp-admins"),
                Target::scope("/subscriptions/sub1"),
                Target::scope("/subscriptions/sub1/resourceGroups/rg1"),
            ])
        );
        assert!(state.rulesets.contains_key("short"));
        assert_eq!(state.policies.default, vec!["short"]);

        let member = state
            .grants
            .iter()
            .find(|g| g.target == Target::group("grp-admins"))
            .expect("group grant");
        assert_eq!(member.kind, GrantKind::Eligible);
        assert_eq!(member.principal_kind, PrincipalKind::User);
        Ok(())
    }

    #[test]
    fn a_single_file_loads() -> Result<()> {
        let file = std::env::temp_dir().join(format!("pimsync-config-{}.yaml", Uuid::new_v4()));
        fs::write(&file, SUBSCRIPTIONS)?;
        let state = load(&file)?;
        fs::remove_file(&file)?;
        assert_eq!(state.grants.len(), 1);
        assert!(state.grants[0].end.is_some());
        Ok(())
    }

    #[test]
    fn missing_files_are_reported() {
        let err = load("/definitely/not/here.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("problem reading"));
    }
}
