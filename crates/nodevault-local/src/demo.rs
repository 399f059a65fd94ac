//! Scripted lifecycle scenarios against in-memory storage.

use std::sync::Arc;
use std::time::Duration;

use nodevault_core::{
    ApprovingMode, NewNode, NodeHead, NodeId, NodeTypeId, Properties, RepositoryError, RepositoryPath,
    VersioningMode,
};
use tracing::info;

use nodevault_local::{
    AllowAll, BroadcastCluster, CancellationSignal, CancellationSource, HeadCache, HeadResolver, MemoryVersionStore,
    Notifier, TreeLockRegistry, TreeService, VersionSelector, VersionService,
};

struct Demo {
    versions: VersionService,
    tree: TreeService,
    resolver: HeadResolver,
    locks: TreeLockRegistry,
    cancel: CancellationSignal,
}

fn props(title: &str) -> Properties {
    Properties::new().with("Title", title)
}

fn show(step: &str, head: &NodeHead) {
    println!("  {:<28} {:<24} {}", step, head.summary(), head.path);
}

impl Demo {
    fn new(locks: TreeLockRegistry, cluster: Arc<BroadcastCluster>, cancel: CancellationSignal) -> Self {
        let store = Arc::new(MemoryVersionStore::new());
        let permissions = Arc::new(AllowAll);
        let cache = HeadCache::new(store.clone(), Duration::from_secs(300), 10_000);
        cache.listen(cluster.subscribe());

        let notifier = Notifier::new(Arc::new(cache.clone())).with_cluster(cluster);
        Self {
            versions: VersionService::new(store.clone(), locks.clone(), permissions.clone())
                .with_notifier(notifier.clone()),
            tree: TreeService::new(store.clone(), locks.clone(), permissions.clone()).with_notifier(notifier),
            resolver: HeadResolver::new(store, permissions).with_cache(cache),
            locks,
            cancel,
        }
    }

    async fn folder(
        &self,
        parent: Option<NodeId>,
        name: &str,
        versioning: VersioningMode,
        approving: ApprovingMode,
    ) -> Result<NodeId, RepositoryError> {
        let node = NewNode::new(parent, name, NodeTypeId(1))
            .with_versioning(versioning)
            .with_approving(approving);
        Ok(self.versions.create_node(node, &self.cancel).await?.id)
    }

    async fn document(&self, parent: NodeId, name: &str) -> Result<NodeId, RepositoryError> {
        let node = NewNode::new(Some(parent), name, NodeTypeId(2));
        Ok(self.versions.create_node(node, &self.cancel).await?.id)
    }

    async fn lifecycle(&self, root: NodeId) -> Result<(), RepositoryError> {
        println!("Major and minor versioning without approval");
        let folder = self
            .folder(Some(root), "Minor", VersioningMode::MajorAndMinor, ApprovingMode::False)
            .await?;
        let doc = self.document(folder, "Report").await?;
        let c = &self.cancel;

        show("save", &self.versions.save(doc, props("first"), c).await?);
        show("check out", &self.versions.check_out(doc, "alice", c).await?);
        show("save while checked out", &self.versions.save(doc, props("edited"), c).await?);
        show("check in", &self.versions.check_in(doc, c).await?);
        show("save", &self.versions.save(doc, props("second"), c).await?);
        Ok(())
    }

    async fn approval(&self, root: NodeId) -> Result<(), RepositoryError> {
        println!("Major and minor versioning with approval");
        let folder = self
            .folder(Some(root), "Approved", VersioningMode::MajorAndMinor, ApprovingMode::True)
            .await?;
        let doc = self.document(folder, "Contract").await?;
        let c = &self.cancel;

        show("save", &self.versions.save(doc, props("draft"), c).await?);
        show("publish", &self.versions.publish(doc, c).await?);
        show("reject", &self.versions.reject(doc, c).await?);
        show("save", &self.versions.save(doc, props("revised"), c).await?);
        show("publish", &self.versions.publish(doc, c).await?);
        let head = self.versions.approve(doc, c).await?;
        show("approve", &head);

        let head = self.resolver.head(doc).await?;
        if let Some(snapshot) = self.resolver.load_version(&head, VersionSelector::LastAccessible).await? {
            println!("  last accessible: {} {:?}", snapshot.label(), snapshot.properties.get("Title"));
        }
        Ok(())
    }

    async fn collapse(&self, root: NodeId) -> Result<(), RepositoryError> {
        println!("No versioning: check-in collapses onto the previous version");
        let folder = self
            .folder(Some(root), "Flat", VersioningMode::None, ApprovingMode::False)
            .await?;
        let doc = self.document(folder, "Notes").await?;
        let c = &self.cancel;

        show("save", &self.versions.save(doc, props("one"), c).await?);
        show("save", &self.versions.save(doc, props("two"), c).await?);
        let captured = self.versions.check_out(doc, "bob", c).await?;
        show("check out", &captured);
        self.versions.save(doc, props("three"), c).await?;
        show("check in", &self.versions.check_in(doc, c).await?);

        match self
            .resolver
            .load_version(&captured, VersionSelector::LastAccessible)
            .await?
        {
            Some(snapshot) => println!(
                "  stale head resolved to {} {:?}",
                snapshot.label(),
                snapshot.properties.get("Title")
            ),
            None => println!("  stale head resolved to nothing"),
        }
        Ok(())
    }

    async fn contention(&self, root: NodeId) -> Result<(), RepositoryError> {
        println!("Tree locks block structural changes");
        let source = self
            .folder(Some(root), "Source", VersioningMode::MajorOnly, ApprovingMode::False)
            .await?;
        let target = self
            .folder(Some(root), "Target", VersioningMode::MajorOnly, ApprovingMode::False)
            .await?;
        let doc = self.document(source, "Plan").await?;
        self.versions.save(doc, props("plan"), &self.cancel).await?;

        let doc_path = self.resolver.head(doc).await?.path.clone();
        let guard = self.locks.acquire(&doc_path).await?;
        println!("  locked {}", doc_path);

        match self.tree.move_node(source, target, &self.cancel).await {
            Err(err @ RepositoryError::LockedTree { .. }) => println!("  move refused: {}", err),
            Err(err) => return Err(err),
            Ok(_) => println!("  move unexpectedly succeeded"),
        }
        match self.versions.save(doc, props("blocked"), &self.cancel).await {
            Err(err) => println!("  save refused: {}", err),
            Ok(head) => show("save", &head),
        }

        guard.release().await?;
        let moved = self.tree.move_node(source, target, &self.cancel).await?;
        for record in &moved {
            println!("  moved {} -> {}", record.id, record.path);
        }
        let moved_path = RepositoryPath::parse("/Root/Target/Source/Plan")?;
        println!("  {} locked: {}", moved_path, self.locks.is_locked(&moved_path).await?);
        Ok(())
    }
}

/// Run every scenario against a fresh in-memory repository that shares
/// `locks` with the caller.
pub async fn run(locks: TreeLockRegistry, cluster: Arc<BroadcastCluster>) -> anyhow::Result<()> {
    let source = CancellationSource::new();
    let demo = Demo::new(locks, cluster, source.signal());

    let root = demo
        .folder(None, "Root", VersioningMode::None, ApprovingMode::False)
        .await?;
    info!("Demo repository root is node {}", root);

    demo.lifecycle(root).await?;
    demo.approval(root).await?;
    demo.collapse(root).await?;
    demo.contention(root).await?;

    source.cancel();
    match demo.versions.save(root, props("late"), &source.signal()).await {
        Err(RepositoryError::Cancelled) => println!("Cancelled operations leave the repository untouched"),
        other => println!("Unexpected result after cancel: {:?}", other.map(|h| h.summary())),
    }
    Ok(())
}
