//! Example: a forum thread page filling in while subscribers react
//!
//! Run with `RUST_LOG=fco_observer=debug` to see the pipeline at work.

use std::cell::RefCell;
use std::rc::Rc;

use fco_dom::{DomTree, ElementVisibility, TreeAccess, Viewport};
use fco_observer::{
    FeedFactory, Location, Observer, ObserverConfig, Priority, SourceKind, SubscriptionDescriptor,
    VirtualScheduler,
};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let factory = FeedFactory::new();
    let scheduler = VirtualScheduler::new();
    let mut observer = Observer::new(
        DomTree::new(),
        scheduler,
        factory.clone(),
        ObserverConfig::default(),
    )?;
    observer.navigate(Location::parse("https://forum.example/showthread.php?t=1024"))?;

    let log = Rc::new(RefCell::new(Vec::new()));
    for (name, selector, priority) in [
        ("layout-fix", ".postbit", Priority::Critical),
        ("quote-collapse", ".bbcode_quote", Priority::High),
        ("signature-trim", ".signature", Priority::Normal),
        ("image-lightbox", "img", Priority::Low),
        ("stats-badge", ".postbit", Priority::Idle),
    ] {
        let log = Rc::clone(&log);
        observer.register(
            SubscriptionDescriptor::new(move |ctx| {
                log.borrow_mut()
                    .push(format!("{:>6}ms {name} on {}", ctx.now_ms(), ctx.target()));
                Ok(())
            })
            .id(name)
            .selector(selector)
            .priority(priority),
        )?;
    }

    observer.start()?;

    // Three posts arrive, the last one with an attachment far below the fold
    let root = observer.tree().root();
    for n in 0..3 {
        let id = format!("post{n}");
        let tree = observer.tree_mut();
        let post =
            tree.append_element(root, "div", &[("class", "postbit"), ("id", id.as_str())])?;
        tree.append_element(post, "div", &[("class", "bbcode_quote")])?;
        tree.append_element(post, "div", &[("class", "signature")])?;
        if n == 2 {
            let img = tree.append_element(post, "img", &[("src", "/attachments/9.png")])?;
            tree.set_layout(img, ElementVisibility::boxed(0.0, 4000.0, 640.0, 480.0))?;
        }
        let records = observer.tree_mut().take_records();
        if let Some(primary) = factory.latest(SourceKind::Primary) {
            primary.push_records(records);
        }
        observer.run_pending();
    }
    observer.run_for(50);

    // Scroll the attachment into view
    observer.set_viewport(Viewport::new(0.0, 3600.0, 1280.0, 800.0))?;
    observer.run_for(50);

    for line in log.borrow().iter() {
        println!("{line}");
    }
    println!("{}", serde_json::to_string_pretty(&observer.stats())?);

    observer.destroy();
    Ok(())
}
