//! Handling of inbound closed-group control messages.
//!
//! Control messages that fail a policy check (unknown group, stale
//! timestamp, non-member or non-admin sender, attempts to remove the primary
//! admin) are logged and dropped. They never surface as receive errors.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::crypto::decrypt_session;
use crate::groups::{GroupEvent, GroupKeyPair, GroupMembership};
use crate::message::{ClosedGroupControlMessage, KeyPairWrapper, Message};
use crate::receiver::MessageReceiver;
use crate::types::Result;

/// Fields of a `new` control message.
struct NewGroup<'a> {
    public_key: &'a str,
    name: &'a str,
    key_pair: &'a GroupKeyPair,
    members: &'a [String],
    admins: &'a [String],
    expiration_timer: u32,
}

impl MessageReceiver {
    pub(crate) async fn handle_closed_group_control(
        &self,
        message: &Message,
        control: &ClosedGroupControlMessage,
    ) -> Result<()> {
        match control {
            ClosedGroupControlMessage::New {
                public_key,
                name,
                key_pair,
                members,
                admins,
                expiration_timer,
            } => {
                self.handle_new_group(
                    message,
                    NewGroup {
                        public_key,
                        name,
                        key_pair,
                        members,
                        admins,
                        expiration_timer: *expiration_timer,
                    },
                )
                .await
            }
            ClosedGroupControlMessage::EncryptionKeyPair {
                public_key,
                wrappers,
            } => {
                self.handle_encryption_key_pair(message, public_key.as_deref(), wrappers)
                    .await
            }
            ClosedGroupControlMessage::NameChange { name } => {
                self.handle_name_change(message, name).await
            }
            ClosedGroupControlMessage::MembersAdded { members } => {
                self.handle_members_added(message, members).await
            }
            ClosedGroupControlMessage::MembersRemoved { members } => {
                self.handle_members_removed(message, members).await
            }
            ClosedGroupControlMessage::MemberLeft => self.handle_member_left(message).await,
            ClosedGroupControlMessage::EncryptionKeyPairRequest => {
                debug!(
                    sender = message.sender.as_deref().unwrap_or_default(),
                    "Ignoring encryption key pair request"
                );
                Ok(())
            }
        }
    }

    /// The group's membership, if the message may act on it.
    ///
    /// Requires that the group exists, the message is not older than the
    /// group's formation and the sender is a member.
    async fn validated_membership(&self, message: &Message) -> Result<Option<GroupMembership>> {
        let Some(group) = message.group_public_key.as_deref() else {
            debug!("Ignoring closed group update without group");
            return Ok(None);
        };
        let Some(membership) = self.services.groups.membership(group).await? else {
            debug!(group = %group, "Ignoring closed group update for unknown group");
            return Ok(None);
        };
        let sent_timestamp = message.sent_timestamp.unwrap_or_default();
        if sent_timestamp < membership.formation_timestamp {
            debug!(group = %group, sent_timestamp, "Ignoring closed group update from before formation");
            return Ok(None);
        }
        let sender = message.sender.as_deref().unwrap_or_default();
        if !membership.is_member(sender) {
            debug!(group = %group, sender = %sender, "Ignoring closed group update from non-member");
            return Ok(None);
        }
        Ok(Some(membership))
    }

    async fn handle_new_group(&self, message: &Message, new_group: NewGroup<'_>) -> Result<()> {
        let user_id = self.session_id();
        let group = new_group.public_key;

        let mut has_trusted_admin = false;
        for admin in new_group.admins {
            if *admin == user_id || self.services.contacts.is_approved(admin).await? {
                has_trusted_admin = true;
                break;
            }
        }
        if !has_trusted_admin {
            info!(group = %group, "Ignoring new closed group without an approved admin");
            return Ok(());
        }

        let key_history = self.services.groups.key_history(group).await?;
        if key_history.contains(new_group.key_pair) {
            debug!(group = %group, "Closed group already set up");
            return Ok(());
        }

        let mut membership = GroupMembership::new(
            group,
            new_group.name,
            new_group.members.iter().cloned(),
            new_group.admins.to_vec(),
            message.sent_timestamp.unwrap_or_default(),
        );
        membership.expiration_timer = new_group.expiration_timer;
        if !key_history.is_empty() {
            if let Some(existing) = self.services.groups.membership(group).await? {
                membership.zombies = existing.zombies;
            }
        }
        self.services.groups.set_membership(membership).await?;
        self.services
            .groups
            .append_key(group, new_group.key_pair.clone())
            .await?;

        // Reached only once per key, so an interrupted earlier pass is completed here.
        self.services.poller.start_polling(group).await;
        if let Err(e) = self.services.push.subscribe(group, &user_id).await {
            warn!(group = %group, error = %e, "Couldn't subscribe to group notifications");
        }
        if key_history.is_empty() {
            self.services
                .events
                .emit(GroupEvent::Created {
                    group: group.to_string(),
                    name: new_group.name.to_string(),
                })
                .await;
        }
        info!(group = %group, "Joined closed group");
        Ok(())
    }

    async fn handle_encryption_key_pair(
        &self,
        message: &Message,
        explicit_group: Option<&str>,
        wrappers: &[KeyPairWrapper],
    ) -> Result<()> {
        let user_id = self.session_id();
        let sender = message.sender.as_deref().unwrap_or_default();
        let Some(group) = explicit_group.or(message.group_public_key.as_deref()) else {
            warn!(sender = %sender, "Ignoring key pair without group");
            return Ok(());
        };
        let Some(membership) = self.services.groups.membership(group).await? else {
            debug!(group = %group, "Ignoring key pair for unknown group");
            return Ok(());
        };
        if !membership.is_admin(sender) {
            warn!(group = %group, sender = %sender, "Ignoring key pair from non-admin");
            return Ok(());
        }

        let Some(wrapper) = wrappers.iter().find(|w| w.public_key == user_id) else {
            debug!(group = %group, "No key pair wrapper for us");
            return Ok(());
        };
        let Ok((plaintext, wrapper_sender)) = decrypt_session(
            &wrapper.encrypted_key_pair,
            self.keys.x25519_private_key(),
            self.keys.x25519_public_key(),
        ) else {
            warn!(group = %group, "Couldn't decrypt closed group key pair");
            return Ok(());
        };
        if wrapper_sender != sender {
            warn!(group = %group, sender = %sender, "Key pair wrapper sealed by another user");
            return Ok(());
        }
        let Ok(key_pair) = GroupKeyPair::from_payload(&plaintext) else {
            warn!(group = %group, "Couldn't parse closed group key pair");
            return Ok(());
        };

        let key_history = self.services.groups.key_history(group).await?;
        if key_history.contains(&key_pair) {
            info!(group = %group, "Ignoring duplicate closed group key pair");
            return Ok(());
        }
        self.services.groups.append_key(group, key_pair).await?;
        self.services
            .events
            .emit(GroupEvent::KeyPairReceived {
                group: group.to_string(),
            })
            .await;
        info!(group = %group, "Received new closed group key pair");
        Ok(())
    }

    async fn handle_name_change(&self, message: &Message, name: &str) -> Result<()> {
        let Some(mut membership) = self.validated_membership(message).await? else {
            return Ok(());
        };
        if membership.name == name {
            return Ok(());
        }
        membership.name = name.to_string();
        let group = membership.group_public_key.clone();
        self.services.groups.set_membership(membership).await?;
        self.services
            .events
            .emit(GroupEvent::NameChanged {
                group,
                name: name.to_string(),
            })
            .await;
        Ok(())
    }

    async fn handle_members_added(&self, message: &Message, added: &[String]) -> Result<()> {
        let Some(mut membership) = self.validated_membership(message).await? else {
            return Ok(());
        };
        let user_id = self.session_id();
        let group = membership.group_public_key.clone();
        let is_admin = membership.is_admin(&user_id);

        membership.members.extend(added.iter().cloned());
        membership.zombies.retain(|z| !added.contains(z));
        self.services.groups.set_membership(membership).await?;
        self.services
            .events
            .emit(GroupEvent::MembersAdded {
                group: group.clone(),
                members: added.to_vec(),
            })
            .await;

        // A member other than us may have added people while we were
        // rotating; make sure they end up with the newest key.
        if is_admin {
            for member in added.iter().filter(|m| **m != user_id) {
                if let Err(e) = self.sender.send_latest_key_pair(member, &group).await {
                    warn!(group = %group, member = %member, error = %e, "Couldn't send latest key pair");
                }
            }
        }
        Ok(())
    }

    async fn handle_members_removed(&self, message: &Message, removed: &[String]) -> Result<()> {
        let Some(mut membership) = self.validated_membership(message).await? else {
            return Ok(());
        };
        let user_id = self.session_id();
        let sender = message.sender.as_deref().unwrap_or_default();
        let group = membership.group_public_key.clone();
        let removed: BTreeSet<String> = removed.iter().cloned().collect();

        if let Some(primary) = membership.primary_admin() {
            if removed.contains(primary) {
                warn!(group = %group, "Ignoring attempt to remove the group admin");
                return Ok(());
            }
        }
        if !membership.is_admin(sender) {
            warn!(group = %group, sender = %sender, "Ignoring member removal from non-admin");
            return Ok(());
        }

        membership.members.retain(|m| !removed.contains(m));
        membership.zombies.retain(|z| !removed.contains(z));
        self.services.groups.set_membership(membership).await?;

        if removed.contains(&user_id) {
            self.teardown(&group, &user_id).await?;
            self.services.events.emit(GroupEvent::Removed { group }).await;
            return Ok(());
        }

        self.services
            .events
            .emit(GroupEvent::MembersRemoved {
                group,
                members: removed.into_iter().collect(),
            })
            .await;
        Ok(())
    }

    async fn handle_member_left(&self, message: &Message) -> Result<()> {
        let Some(mut membership) = self.validated_membership(message).await? else {
            return Ok(());
        };
        let user_id = self.session_id();
        let leaver = message.sender.clone().unwrap_or_default();
        let group = membership.group_public_key.clone();

        if membership.is_admin(&leaver) {
            membership.members.clear();
            membership.zombies.clear();
            self.services.groups.set_membership(membership).await?;
            self.teardown(&group, &user_id).await?;
            info!(group = %group, admin = %leaver, "Admin left, closed group disbanded");
            self.services.events.emit(GroupEvent::Disbanded { group }).await;
            return Ok(());
        }

        if leaver == user_id {
            // Left from another of our devices.
            membership.members.remove(&user_id);
            self.services.groups.set_membership(membership).await?;
            self.teardown(&group, &user_id).await?;
            return Ok(());
        }

        membership.zombies.insert(leaver.clone());
        self.services.groups.set_membership(membership).await?;
        self.services
            .events
            .emit(GroupEvent::MemberLeft {
                group,
                member: leaver,
            })
            .await;
        Ok(())
    }

    async fn teardown(&self, group: &str, user_id: &str) -> Result<()> {
        self.services.poller.stop_polling(group).await;
        self.services.groups.purge_group(group).await?;
        if let Err(e) = self.services.push.unsubscribe(group, user_id).await {
            warn!(group = %group, error = %e, "Couldn't unsubscribe from group notifications");
        }
        Ok(())
    }
}
