//! Mock backend example: preview a mount plan without privileges

use cbuildrt_mount::{
    ContainerRoot, Essentials, MockBackend, MountExecutor, MountOp, MountPlanBuilder, MountSpec,
    Teardown,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("🧪 Previewing a mount plan with MockBackend (no mounts performed)\n");

    let source = std::env::current_dir()?;
    let plan = MountPlanBuilder::new()
        .essentials(Essentials::default())
        .mount(MountSpec::bind(&source, "/input").read_only())
        .mount(MountSpec::tmpfs("/output"))
        .build()?;

    println!("📋 Plan ({} mounts):", plan.len());
    for spec in &plan {
        println!("  {spec}");
    }

    let root = ContainerRoot::scratch(true)?;
    println!("\n📁 Scratch root: {}", root.path().display());

    let backend = MockBackend::new();
    let handle = MountExecutor::new(&backend).execute(&plan, &root)?;

    println!("\n🔧 Backend calls:");
    for op in backend.ops() {
        match op {
            MountOp::Bind { source, target, .. } => {
                println!("  bind    {} -> {}", source.display(), target.display());
            }
            MountOp::Mount { fstype, target } => {
                println!("  mount   {fstype} at {}", target.display());
            }
            MountOp::Remount { target, read_only } => {
                println!("  remount {} (ro={read_only})", target.display());
            }
            MountOp::MakePrivate { target } | MountOp::Unmount { target } => {
                println!("  other   {}", target.display());
            }
        }
    }

    let report = Teardown::new(&backend).finish(handle, root);
    println!(
        "\n✅ Teardown reversed {} entries ({} warnings)",
        report.reversed.len(),
        report.warnings.len()
    );

    Ok(())
}
