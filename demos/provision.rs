use std::sync::atomic::{AtomicUsize, Ordering};

use kumiki::Batch;

// -----------------------------------------------------------------------------
// Diamond dependency provisioning example
//
// Use Case:
// Two virtual machines share one network, one subnet and one firewall.
// The shared pieces must exist before either VM, they must be allocated
// exactly once, and the VMs themselves should come up in parallel.
//
// Topology:
//            [network]
//            /        \
//      [subnet]    [firewall]
//            \        /
//        [vm-a]    [vm-b]
//
// The second half of the example provisions a similar group where the
// firewall allocation fails, to show best-effort creation: the failure
// blocks only the VMs, the report lists every outcome, and the resources
// that came up for nothing are flagged as orphans.
// -----------------------------------------------------------------------------

/// A stand-in for a cloud API client.
struct Cloud {
    region: &'static str,
    api_calls: AtomicUsize,
}

impl Cloud {
    fn new(region: &'static str) -> Self {
        Self {
            region,
            api_calls: AtomicUsize::new(0),
        }
    }

    fn allocate(&self, kind: &str, name: &str) -> String {
        let n = self.api_calls.fetch_add(1, Ordering::SeqCst);
        format!("{}/{kind}/{name}-{n:03}", self.region)
    }
}

#[derive(Debug)]
struct Network {
    id: String,
}

#[derive(Debug)]
struct Subnet {
    id: String,
    cidr: &'static str,
}

#[derive(Debug)]
struct Firewall {
    id: String,
}

#[derive(Debug)]
struct Vm {
    id: String,
    subnet: String,
}

fn main() -> anyhow::Result<()> {
    kumiki::init_logging()?;

    // -----------------------------------------------------------------------
    // 1. Define the shared infrastructure
    // -----------------------------------------------------------------------
    // Handles are cheap clones of the same definition; requiring `network`
    // from two places still allocates it once per run.
    let mut batch = Batch::<Cloud>::new();

    let network = batch.define("network").create_with(|ctx| {
        Ok(Network {
            id: ctx.env.allocate("net", ctx.name()),
        })
    });

    let subnet = batch
        .define("subnet")
        .requires(network.clone())
        .create_with(|ctx, network| {
            println!("  placing subnet inside {}", network.id);
            Ok(Subnet {
                id: ctx.env.allocate("subnet", ctx.name()),
                cidr: "10.0.1.0/24",
            })
        });

    let firewall = batch
        .define("firewall")
        .requires(network.clone())
        .create_with(|ctx, _network| {
            Ok(Firewall {
                id: ctx.env.allocate("fw", ctx.name()),
            })
        });

    // -----------------------------------------------------------------------
    // 2. Define the machines on top
    // -----------------------------------------------------------------------
    // A tuple requirement injects both outputs, each with its own type.
    let vm_a = batch
        .define("vm-a")
        .requires((subnet.clone(), firewall.clone()))
        .create_with(|ctx, (subnet, _firewall)| {
            Ok(Vm {
                id: ctx.env.allocate("vm", ctx.name()),
                subnet: subnet.id.clone(),
            })
        });

    let vm_b = batch
        .define("vm-b")
        .requires((subnet.clone(), firewall.clone()))
        .create_with(|ctx, (subnet, _firewall)| {
            Ok(Vm {
                id: ctx.env.allocate("vm", ctx.name()),
                subnet: subnet.id.clone(),
            })
        });

    // -----------------------------------------------------------------------
    // 3. Create everything, watching resources come up live
    // -----------------------------------------------------------------------
    println!("provisioning in dependency order:");

    let mut stream = batch.create_stream(&[vm_a.clone(), vm_b.clone()], Cloud::new("eu-central"))?;

    for event in stream.by_ref() {
        let role = if event.top_level {
            "requested"
        } else {
            "dependency"
        };
        println!("  up: {:24} ({role})", event.resource.name());
    }

    let created = stream.finish()?;

    println!("\ncreated {} machines:", created.len());
    for (_, vm) in created.iter() {
        println!("  {} on {}", vm.id, vm.subnet);
    }
    println!(
        "subnet cidr: {}",
        created
            .created_related_resource(subnet.key())
            .and_then(|r| r.downcast_ref::<Subnet>())
            .map(|s| s.cidr)
            .unwrap_or("?")
    );
    if let Some(total) = created.diagnostics().total_duration() {
        println!("settled in {total:?}");
    }

    // -----------------------------------------------------------------------
    // 4. Best-effort creation with a failing branch
    // -----------------------------------------------------------------------
    // The firewall allocation is rigged to fail. The VM depending on it is
    // skipped, but the network and subnet still come up; both end up as
    // orphans because only the failed branch wanted them.
    let mut batch = Batch::<Cloud>::new();

    let network = batch.define("network").create_with(|ctx| {
        Ok(Network {
            id: ctx.env.allocate("net", ctx.name()),
        })
    });
    let subnet = batch
        .define("subnet")
        .requires(network.clone())
        .create_with(|ctx, _| {
            Ok(Subnet {
                id: ctx.env.allocate("subnet", ctx.name()),
                cidr: "10.0.2.0/24",
            })
        });
    let firewall = batch
        .define("firewall")
        .requires(network.clone())
        .create_with(|_, _| Err::<Firewall, _>(anyhow::anyhow!("firewall quota exceeded")));
    let vm = batch
        .define("vm-c")
        .requires((subnet.clone(), firewall.clone()))
        .create_with(|ctx, (subnet, _)| {
            Ok(Vm {
                id: ctx.env.allocate("vm", ctx.name()),
                subnet: subnet.id.clone(),
            })
        });

    let partial = batch.create_all(&[vm], Cloud::new("eu-central"))?;

    println!("\nbest-effort run:");
    for failure in partial.failures() {
        println!("  failed:  {} ({})", failure.name, failure.error);
    }
    for skipped in partial.skipped() {
        println!("  skipped: {} (blocked on {})", skipped.name, skipped.blocked_on);
    }
    for orphan in partial.orphaned() {
        println!("  orphan:  {} ({})", orphan.name(), orphan.key());
    }

    println!("\naudit report:\n{}", partial.report().to_json()?);

    Ok(())
}
