use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Authorization {
    Granted,
    Denied,
}

/// Static set of identities allowed to change what is on tap.
///
/// Identities compare case-insensitively and a leading `@` is ignored.
#[derive(Debug, Clone, Default)]
pub(crate) struct AllowList {
    admins: HashSet<String>,
}

fn normalise(identity: &str) -> String {
    identity.trim().trim_start_matches('@').to_lowercase()
}

impl AllowList {
    pub(crate) fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            admins: admins
                .into_iter()
                .map(|a| normalise(a.as_ref()))
                .filter(|a| !a.is_empty())
                .collect(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.admins.is_empty()
    }

    pub(crate) fn authorize(&self, sender: &str) -> Authorization {
        if self.admins.contains(&normalise(sender)) {
            Authorization::Granted
        } else {
            Authorization::Denied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_ignores_case_and_at() {
        let list = AllowList::new(["Head_Brewer", "@cellar"]);

        assert_eq!(list.authorize("head_brewer"), Authorization::Granted);
        assert_eq!(list.authorize("@HEAD_BREWER"), Authorization::Granted);
        assert_eq!(list.authorize("Cellar"), Authorization::Granted);
        assert_eq!(list.authorize("thirsty"), Authorization::Denied);
    }

    #[test]
    fn empty_list_denies_everyone() {
        let list = AllowList::new(Vec::<String>::new());

        assert!(list.is_empty());
        assert_eq!(list.authorize(""), Authorization::Denied);
        assert_eq!(list.authorize("anyone"), Authorization::Denied);
    }
}
