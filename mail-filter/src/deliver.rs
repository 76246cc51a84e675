//! The built-in `deliver:` / `copy:` filters: place the committed
//! message into per-mailbox directories under the delivery root.

use std::path::Path;

use tracing::{info, warn};

use mail_spool::{MessageId, Store};

use crate::Outcome;

pub(crate) async fn run(
    store: &Store,
    id: &MessageId,
    delivery_dir: Option<&Path>,
    move_out: bool,
) -> Outcome {
    let mut envelope = match store.read_envelope(id).await {
        Ok(env) => env,
        Err(e) => return Outcome::Temporary(format!("cannot read envelope: {}", e)),
    };
    if envelope.to_local.is_empty() {
        return Outcome::Ok;
    }
    let delivery_dir = match delivery_dir {
        Some(dir) => dir,
        None => return Outcome::Temporary("no delivery directory configured".to_owned()),
    };

    for mailbox in &envelope.to_local {
        if !valid_mailbox(mailbox) {
            warn!(mailbox = mailbox.as_str(), "refusing suspicious mailbox name");
            return Outcome::Temporary(format!("bad mailbox name ‘{}’", mailbox));
        }
        let dir = delivery_dir.join(mailbox);
        if let Err(e) = smol::fs::create_dir_all(&dir).await {
            return Outcome::Temporary(format!("cannot create mailbox: {}", e));
        }
        let content_to = dir.join(
            store
                .content_path(id)
                .file_name()
                .map(|n| n.to_owned())
                .unwrap_or_default(),
        );
        let envelope_to = dir.join(
            store
                .envelope_path(id)
                .file_name()
                .map(|n| n.to_owned())
                .unwrap_or_default(),
        );
        if let Err(e) = smol::fs::copy(store.content_path(id), &content_to).await {
            return Outcome::Temporary(format!("cannot copy content: {}", e));
        }
        if let Err(e) = smol::fs::copy(store.envelope_path(id), &envelope_to).await {
            return Outcome::Temporary(format!("cannot copy envelope: {}", e));
        }
        info!(id = %id, mailbox = mailbox.as_str(), "delivered locally");
    }

    if move_out {
        envelope.to_local.clear();
        if envelope.to_remote.is_empty() {
            // Nothing left to forward: the message is fully delivered
            if let Err(e) = store.delete(id).await {
                return Outcome::Temporary(format!("cannot retire message: {}", e));
            }
        } else if let Err(e) = store.rewrite_envelope(id, &envelope).await {
            return Outcome::Temporary(format!("cannot rewrite envelope: {}", e));
        }
    }
    Outcome::Ok
}

fn valid_mailbox(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use mail_spool::Envelope;

    async fn spooled(dir: &Path, to_local: &[&str], to_remote: &[&str]) -> (Store, MessageId) {
        let store = Store::open(dir.to_owned()).await.unwrap();
        let mut w = store
            .new_message(Envelope {
                from: "u@a.example".to_owned(),
                from_is_local: true,
                client: "127.0.0.1:1".to_owned(),
                ..Envelope::default()
            })
            .await
            .unwrap();
        for to in to_local {
            w.add_to(to, true);
        }
        for to in to_remote {
            w.add_to(to, false);
        }
        w.write_line(b"body").await.unwrap();
        let id = w.commit(false).await.unwrap();
        (store, id)
    }

    #[test]
    fn deliver_moves_fully_local_message() {
        let spool = tempdir::TempDir::new("deliver-spool").unwrap();
        let boxes = tempdir::TempDir::new("deliver-boxes").unwrap();
        smol::block_on(async {
            let (store, id) = spooled(spool.path(), &["alice"], &[]).await;
            let out = run(&store, &id, Some(boxes.path()), true).await;
            assert_eq!(out, Outcome::Ok);
            // Landed in the mailbox, gone from the spool
            assert!(boxes
                .path()
                .join("alice")
                .join(format!("{}.content", id))
                .exists());
            assert!(store.scan().await.unwrap().is_empty());
        });
    }

    #[test]
    fn deliver_keeps_remote_recipients() {
        let spool = tempdir::TempDir::new("deliver-spool").unwrap();
        let boxes = tempdir::TempDir::new("deliver-boxes").unwrap();
        smol::block_on(async {
            let (store, id) = spooled(spool.path(), &["alice"], &["v@b.example"]).await;
            assert_eq!(run(&store, &id, Some(boxes.path()), true).await, Outcome::Ok);
            let env = store.read_envelope(&id).await.unwrap();
            assert!(env.to_local.is_empty());
            assert_eq!(env.to_remote, vec!["v@b.example"]);
            assert_eq!(store.scan().await.unwrap(), vec![id]);
        });
    }

    #[test]
    fn copy_leaves_the_original() {
        let spool = tempdir::TempDir::new("deliver-spool").unwrap();
        let boxes = tempdir::TempDir::new("deliver-boxes").unwrap();
        smol::block_on(async {
            let (store, id) = spooled(spool.path(), &["alice"], &[]).await;
            assert_eq!(run(&store, &id, Some(boxes.path()), false).await, Outcome::Ok);
            assert!(boxes.path().join("alice").exists());
            let env = store.read_envelope(&id).await.unwrap();
            assert_eq!(env.to_local, vec!["alice"]);
        });
    }

    #[test]
    fn rejects_path_traversal() {
        let spool = tempdir::TempDir::new("deliver-spool").unwrap();
        let boxes = tempdir::TempDir::new("deliver-boxes").unwrap();
        smol::block_on(async {
            let (store, id) = spooled(spool.path(), &["../evil"], &[]).await;
            assert!(matches!(
                run(&store, &id, Some(boxes.path()), true).await,
                Outcome::Temporary(_)
            ));
        });
    }
}
