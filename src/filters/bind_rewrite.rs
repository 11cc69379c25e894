//! Reference in-filter: rewrites a client-presented bind DN of the form
//! `cn=<user>@<dom>.<tld>` into the upstream directory's native
//! `uid=<user>,dc=<dom>,dc=<tld>` form. DNs that don't match the pattern
//! pass through unchanged.

use ldap3_proto::proto::{LdapMsg, LdapOp};

use crate::error::FilterError;

use super::InFilter;

pub struct RewriteBindDn;

impl RewriteBindDn {
    fn rewrite(dn: &str) -> Option<String> {
        let rest = dn.strip_prefix("cn=")?;
        let (user, domain) = rest.split_once('@')?;
        if user.is_empty() || domain.is_empty() {
            return None;
        }
        let dc = domain
            .split('.')
            .filter(|label| !label.is_empty())
            .map(|label| format!("dc={label}"))
            .collect::<Vec<_>>()
            .join(",");
        if dc.is_empty() {
            return None;
        }
        Some(format!("uid={user},{dc}"))
    }
}

impl InFilter for RewriteBindDn {
    fn name(&self) -> &'static str {
        super::REWRITE_BIND_DN
    }

    fn filter(&mut self, req: &mut LdapMsg) -> Result<(), FilterError> {
        if let LdapOp::BindRequest(ref mut lbr) = req.op {
            if let Some(rewritten) = Self::rewrite(&lbr.dn) {
                lbr.dn = rewritten;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldap3_proto::proto::LdapBindCred;
    use ldap3_proto::proto::LdapBindRequest;

    fn bind_msg(dn: &str) -> LdapMsg {
        LdapMsg {
            msgid: 2,
            op: LdapOp::BindRequest(LdapBindRequest {
                dn: dn.to_string(),
                cred: LdapBindCred::Simple("pw".to_string()),
            }),
            ctrl: vec![],
        }
    }

    #[test]
    fn rewrites_matching_dn() {
        let mut msg = bind_msg("cn=alice@corp.example");
        RewriteBindDn.filter(&mut msg).unwrap();
        match msg.op {
            LdapOp::BindRequest(lbr) => assert_eq!(lbr.dn, "uid=alice,dc=corp,dc=example"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn leaves_non_matching_dn_untouched() {
        let mut msg = bind_msg("uid=bob,dc=corp,dc=example");
        RewriteBindDn.filter(&mut msg).unwrap();
        match msg.op {
            LdapOp::BindRequest(lbr) => assert_eq!(lbr.dn, "uid=bob,dc=corp,dc=example"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn never_mutates_messageid() {
        let mut msg = bind_msg("cn=alice@corp.example");
        let before = msg.msgid;
        RewriteBindDn.filter(&mut msg).unwrap();
        assert_eq!(msg.msgid, before);
    }
}
