/// Basic Usage Example for NetAuth Core
///
/// This example demonstrates the fundamental workflow:
/// 1. Assemble a server core (store + tree + token service)
/// 2. Bootstrap the first administrative entity
/// 3. Login and receive a bearer token
/// 4. Create entities and groups with the token
/// 5. Inspect the directory through safe copies
use netauth_core::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== NetAuth Core - Basic Usage Example ===\n");

    // Step 1: Assemble the core around an in-memory store
    println!("Step 1: Assembling server core...");
    let tree = Tree::load(Box::new(MemoryStore::new()), Box::new(DigestKdf))?;
    println!("   Store health: {}", tree.health().detail);

    // Step 2: Bootstrap the first administrator
    println!("\nStep 2: Bootstrapping 'root'...");
    tree.make_bootstrap("root", "hunter2")?;
    let flow = AuthFlow::new(
        tree,
        TokenService::new(TokenKeys::generate(), TokenConfig::default()),
    );
    println!("   ✅ Bootstrap window closed");

    let client = ClientInfo {
        service: "basic-usage".to_string(),
        id: "localhost".to_string(),
    };

    // Step 3: Login
    println!("\nStep 3: Logging in as root...");
    let token = flow.login("root", "hunter2", None)?;
    let claims = flow.tokens().validate(&token)?;
    println!("   ✅ Token issued");
    println!("      - Subject: {}", claims.subject);
    println!("      - Capabilities: {:?}", claims.capabilities);
    println!("      - Valid for: {}s", claims.not_after - claims.issued_at);

    // Step 4: Build out a small directory
    println!("\nStep 4: Creating entities and groups...");
    flow.new_entity(&token, &client, "alice", -1, "password")?;
    println!("   ✅ Entity 'alice' created");

    flow.new_group(&token, &client, "ops", "Operations", "", -1)?;
    flow.manage_group_members(&token, &client, "ops", "alice", Adjustment::Add)?;
    println!("   ✅ Group 'ops' created, alice added");

    // Step 5: Read back safe copies
    println!("\nStep 5: Inspecting the directory...");
    let alice = flow.entity_info(&client, "alice")?;
    println!("   alice: number={}, groups={:?}", alice.number, alice.meta.groups);
    assert!(alice.secret.is_none(), "safe copies never carry secrets");

    for group in flow.list_groups(&client)? {
        println!("   group: {} ({})", group.name, group.display_name);
    }

    println!("\n=== Done ===");
    Ok(())
}
