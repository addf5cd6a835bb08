//! LDAP credential verification.
//!
//! The verifier talks to a [`Directory`]: either the network directory
//! (service-account bind, subtree search, user bind) or a static in-memory
//! directory for development.

use async_trait::async_trait;
use ldap3::{ldap_escape, LdapConnAsync, Scope, SearchEntry};
use processmaster_core::config::{GroupRole, LdapConfig};
use processmaster_core::models::{AuthProvider, Role};

use super::{AuthError, CredentialVerifier, VerifiedIdentity};

/// A directory entry that passed a bind with the user's password.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub dn: String,
    pub uid: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub groups: Vec<String>,
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// `Ok(None)` when the user is unknown or the password is wrong.
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<DirectoryEntry>, AuthError>;
}

// ============================================================================
// Network directory (ldap3)
// ============================================================================

pub struct NetworkDirectory {
    config: LdapConfig,
}

impl NetworkDirectory {
    pub fn new(config: LdapConfig) -> Self {
        Self { config }
    }
}

fn first(entry: &SearchEntry, attr: &str) -> Option<String> {
    entry.attrs.get(attr).and_then(|v| v.first()).cloned()
}

#[async_trait]
impl Directory for NetworkDirectory {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<DirectoryEntry>, AuthError> {
        // An empty password would turn the user bind into an anonymous bind.
        if password.is_empty() {
            return Ok(None);
        }

        let directory_err = |e: ldap3::LdapError| AuthError::Directory(e.to_string());

        let (conn, mut ldap) = LdapConnAsync::new(&self.config.url)
            .await
            .map_err(directory_err)?;
        ldap3::drive!(conn);

        ldap.simple_bind(&self.config.bind_dn, &self.config.bind_password)
            .await
            .map_err(directory_err)?
            .success()
            .map_err(|e| AuthError::Directory(format!("service account bind failed: {}", e)))?;

        let filter = self
            .config
            .search_filter
            .replace("{{username}}", &ldap_escape(username));

        let (entries, _) = ldap
            .search(
                &self.config.search_base,
                Scope::Subtree,
                &filter,
                vec!["dn", "mail", "givenName", "sn", "memberOf", "cn", "uid"],
            )
            .await
            .map_err(directory_err)?
            .success()
            .map_err(directory_err)?;

        let Some(raw) = entries.into_iter().next() else {
            let _ = ldap.unbind().await;
            return Ok(None);
        };
        let entry = SearchEntry::construct(raw);

        let bound = ldap
            .simple_bind(&entry.dn, password)
            .await
            .map_err(directory_err)?
            .success()
            .is_ok();
        let _ = ldap.unbind().await;

        if !bound {
            return Ok(None);
        }

        let Some(email) = first(&entry, "mail") else {
            tracing::warn!(dn = %entry.dn, "Directory entry has no mail attribute");
            return Ok(None);
        };

        Ok(Some(DirectoryEntry {
            uid: first(&entry, "uid")
                .or_else(|| first(&entry, "cn"))
                .unwrap_or_else(|| username.to_string()),
            email,
            first_name: first(&entry, "givenName").unwrap_or_default(),
            last_name: first(&entry, "sn").unwrap_or_default(),
            groups: entry.attrs.get("memberOf").cloned().unwrap_or_default(),
            dn: entry.dn,
        }))
    }
}

// ============================================================================
// Static directory (development)
// ============================================================================

pub struct StaticDirectory {
    entries: Vec<(String, String, DirectoryEntry)>,
}

impl StaticDirectory {
    /// `admin` and `user`, both with password `password123`.
    pub fn development() -> Self {
        let entry = |uid: &str, email: &str, first: &str, group: &str| DirectoryEntry {
            dn: format!("uid={},ou=people,dc=example,dc=com", uid),
            uid: uid.to_string(),
            email: email.to_string(),
            first_name: first.to_string(),
            last_name: "User".to_string(),
            groups: vec![format!("{},ou=groups,dc=example,dc=com", group)],
        };

        Self {
            entries: vec![
                (
                    "admin".to_string(),
                    "password123".to_string(),
                    entry("admin", "admin@company.com", "Admin", "CN=ProcessMaster-Admins"),
                ),
                (
                    "user".to_string(),
                    "password123".to_string(),
                    entry("user", "user@company.com", "Regular", "CN=ProcessMaster-Users"),
                ),
            ],
        }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<DirectoryEntry>, AuthError> {
        Ok(self
            .entries
            .iter()
            .find(|(u, p, e)| (u == username || e.email == username) && p == password)
            .map(|(_, _, e)| e.clone()))
    }
}

// ============================================================================
// Verifier
// ============================================================================

pub struct LdapVerifier {
    directory: Box<dyn Directory>,
    group_roles: Vec<GroupRole>,
}

impl LdapVerifier {
    pub fn new(directory: Box<dyn Directory>, group_roles: Vec<GroupRole>) -> Self {
        Self {
            directory,
            group_roles,
        }
    }

    pub fn from_config(config: &LdapConfig) -> Self {
        let directory: Box<dyn Directory> = if config.mock {
            tracing::warn!("LDAP running against the static development directory");
            Box::new(StaticDirectory::development())
        } else {
            Box::new(NetworkDirectory::new(config.clone()))
        };
        Self::new(directory, config.group_roles.clone())
    }
}

/// First configured group contained in any `memberOf` value wins; `user` otherwise.
pub fn map_groups_to_role(groups: &[String], mapping: &[GroupRole]) -> Role {
    mapping
        .iter()
        .find(|m| {
            let needle = m.group.to_lowercase();
            groups.iter().any(|g| g.to_lowercase().contains(&needle))
        })
        .and_then(|m| m.role.parse().ok())
        .unwrap_or(Role::User)
}

#[async_trait]
impl CredentialVerifier for LdapVerifier {
    fn provider(&self) -> AuthProvider {
        AuthProvider::Ldap
    }

    async fn verify(&self, username: &str, password: &str) -> Result<VerifiedIdentity, AuthError> {
        let entry = self
            .directory
            .authenticate(username, password)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        let role = map_groups_to_role(&entry.groups, &self.group_roles);
        tracing::debug!(dn = %entry.dn, role = %role, "LDAP bind succeeded");

        Ok(VerifiedIdentity {
            email: entry.email,
            first_name: Some(entry.first_name).filter(|s| !s.is_empty()),
            last_name: Some(entry.last_name).filter(|s| !s.is_empty()),
            provider: AuthProvider::Ldap,
            provider_id: Some(entry.uid),
            role: Some(role),
            existing_user: None,
        })
    }
}
