use crate::rule::Rule;

/// `acl_permit(rule, user) → bool`, generic over whatever ACL backend
/// (file-based, principal-pattern, LDAP group) a real deployment plugs in.
pub trait AclChecker {
    fn acl_permit(&self, rule: &Rule, user: &str) -> bool;
}

/// An `AclChecker` that permits everything. Useful for tests and for
/// deployments that delegate authorization entirely to the transport layer.
pub struct AllowAll;

impl AclChecker for AllowAll {
    fn acl_permit(&self, _rule: &Rule, _user: &str) -> bool {
        true
    }
}
