/// Delegated Administration Example for NetAuth Core
///
/// Shows the managed-by mechanism: a group can name another group whose
/// members administer it, without those members holding any capability
/// of their own. Also demonstrates a group expansion feeding the
/// effective membership used by the check.
use netauth_core::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== NetAuth Core - Delegated Administration ===\n");

    let tree = Tree::load(Box::new(MemoryStore::new()), Box::new(DigestKdf))?;
    tree.make_bootstrap("root", "hunter2")?;
    let flow = AuthFlow::new(
        tree,
        TokenService::new(TokenKeys::generate(), TokenConfig::default()),
    );
    let client = ClientInfo {
        service: "delegated-admin".to_string(),
        id: "localhost".to_string(),
    };
    let root = flow.login("root", "hunter2", None)?;

    // 'ops' trusts 'admins' for its administration. 'leads' carries an
    // INCLUDE rule on 'admins', so anyone directly in leads is
    // effectively in admins as well.
    println!("Setting up groups: ops (managed by admins), admins, leads...");
    flow.new_group(&root, &client, "admins", "Administrators", "", -1)?;
    flow.new_group(&root, &client, "ops", "Operations", "admins", -1)?;
    flow.new_group(&root, &client, "leads", "Team Leads", "", -1)?;
    flow.modify_group_expansions(&root, &client, "leads", "admins", "INCLUDE")?;

    // carol is only ever added to leads.
    println!("Creating 'carol', direct member of leads only...");
    flow.new_entity(&root, &client, "carol", -1, "pw")?;
    flow.manage_group_members(&root, &client, "leads", "carol", Adjustment::Add)?;

    let carol_entity = flow.entity_info(&client, "carol")?;
    println!(
        "   carol direct={:?} effective={:?}",
        flow.tree().get_memberships(&carol_entity, false),
        flow.tree().get_memberships(&carol_entity, true),
    );

    // Carol holds no capability, but her effective membership reaches
    // 'admins', and ops trusts admins.
    let carol = flow.login("carol", "pw", None)?;
    println!("\nCarol (no capabilities) renames 'ops'...");
    flow.modify_group_meta(
        &carol,
        &client,
        "ops",
        &GroupPatch {
            display_name: Some("Operations (renamed by carol)".to_string()),
            managed_by: None,
        },
    )?;
    println!(
        "   ✅ ops is now '{}'",
        flow.group_info(&client, "ops")?.group.display_name
    );

    // But a group that trusts nobody refuses her.
    let err = flow
        .modify_group_meta(
            &carol,
            &client,
            "admins",
            &GroupPatch {
                display_name: Some("nope".to_string()),
                managed_by: None,
            },
        )
        .unwrap_err();
    println!("   ✅ admins refused carol: {}", err);

    // Dropping the expansion severs the delegation at the next check.
    println!("\nDropping the leads -> admins expansion...");
    flow.modify_group_expansions(&root, &client, "leads", "admins", "DROP")?;
    let err = flow
        .modify_group_meta(
            &carol,
            &client,
            "ops",
            &GroupPatch {
                display_name: Some("again".to_string()),
                managed_by: None,
            },
        )
        .unwrap_err();
    println!("   ✅ ops now refuses carol: {}", err);

    println!("\n=== Done ===");
    Ok(())
}
