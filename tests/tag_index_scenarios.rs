// End-to-end checks of indexing and lookup through the public API
use phptags::index::db::TagStore;
use phptags::{CancelFlag, Config, Indexer, NativeStore, Tag, TagKind, TagSearch, TagSearchEngine};
use proptest::prelude::*;
use std::fs;
use tempfile::tempdir;

const USER_CLASS: &str =
    "<?php\nclass UserClass { private $name; function getName(){ return $this->name; } }\n";

fn setup(files: &[(&str, &str)]) -> (Indexer, TagSearchEngine) {
    let store = TagStore::open_in_memory().unwrap();
    let indexer = Indexer::new(store.clone(), Config::default());
    for (path, source) in files {
        indexer.build_resource_cache_for_file(path, source, true).unwrap();
    }
    (indexer, TagSearchEngine::new(store))
}

fn exact(engine: &TagSearchEngine, query: &str) -> Vec<Tag> {
    engine
        .create_exact_results(&TagSearch::parse(query))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

fn near(engine: &TagSearchEngine, query: &str) -> Vec<Tag> {
    engine
        .create_near_match_results(&TagSearch::parse(query))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

#[test]
fn exact_member_lookup() {
    let (_indexer, engine) = setup(&[("/src/test.php", USER_CLASS)]);

    let found = exact(&engine, "UserClass::getName");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].kind, TagKind::Method);
    assert_eq!(found[0].class_name, "UserClass");
    assert!(found[0].signature.contains("getName()"));
}

#[test]
fn near_match_on_class_prefix() {
    let (_indexer, engine) = setup(&[("/src/test.php", USER_CLASS)]);

    let found = near(&engine, "UserClas");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].identifier, "UserClass");
    assert_eq!(found[0].kind, TagKind::Class);
}

#[test]
fn same_class_in_two_files_is_reported_per_file() {
    let (_indexer, engine) = setup(&[
        ("/one/test.php", "<?php class UserClass {}"),
        ("/two/test.php", "<?php class UserClass {}"),
    ]);

    let found = near(&engine, "UserClass");
    let paths: Vec<&str> = found.iter().map(|t| t.full_path.as_str()).collect();
    assert_eq!(paths, vec!["/one/test.php", "/two/test.php"]);
}

#[test]
fn namespace_prefix_lists_namespace_then_contents() {
    let (_indexer, engine) = setup(&[(
        "/src/ns.php",
        "<?php\nnamespace First\\Child;\nclass MyClass {}\nfunction singleWork(){}\n",
    )]);

    let listing: Vec<String> = near(&engine, "\\First")
        .iter()
        .map(|t| format!("{} {}", t.kind, t.fully_qualified_name()))
        .collect();
    insta::assert_snapshot!(listing.join("\n"), @r###"
    namespace \First\Child
    class \First\Child\MyClass
    function \First\Child\singleWork
    "###);
}

#[test]
fn deleted_file_leaves_no_matches() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.php");
    fs::write(&path, USER_CLASS).unwrap();

    let store = TagStore::open_in_memory().unwrap();
    let indexer = Indexer::new(store.clone(), Config::default());
    indexer.index_directory(dir.path(), &CancelFlag::new()).unwrap();
    let engine = TagSearchEngine::new(store.clone());
    assert_eq!(exact(&engine, "UserClass").len(), 1);

    fs::remove_file(&path).unwrap();
    let stored = store.all_file_tags().unwrap();
    assert_eq!(stored.len(), 1);
    assert!(indexer.delete_file(&stored[0].full_path).unwrap());

    assert!(exact(&engine, "UserClass").is_empty());
    assert!(near(&engine, "User").is_empty());
    assert!(exact(&engine, "UserClass::getName").is_empty());
}

#[test]
fn trait_members_resolve_to_the_trait() {
    let (_indexer, engine) = setup(&[(
        "/src/t.php",
        "<?php\ntrait T { function f(){} }\nclass C { use T; }\n",
    )]);

    let found = near(&engine, "C::f");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].class_name, "T");
    assert_eq!(found[0].identifier, "f");
}

#[test]
fn reindexing_replaces_previous_tags() {
    let (indexer, engine) = setup(&[("/src/a.php", "<?php class Old { function gone() {} }")]);
    indexer
        .build_resource_cache_for_file("/src/a.php", "<?php class Fresh { function here() {} }", true)
        .unwrap();

    let names: Vec<String> = engine
        .store()
        .find_tags_by_file("/src/a.php")
        .unwrap()
        .into_iter()
        .map(|t| t.identifier)
        .collect();
    assert_eq!(names, vec!["Fresh", "here"]);
    assert!(exact(&engine, "Old").is_empty());
    assert!(exact(&engine, "Old::gone").is_empty());
}

#[test]
fn inherited_property_resolves_to_declaring_class() {
    let (_indexer, engine) = setup(&[(
        "/src/ab.php",
        "<?php\nclass A { public $x; }\nclass B extends A {}\n",
    )]);

    let parents = engine.ancestor_chain("B").unwrap();
    assert_eq!(parents, vec!["A".to_string()]);

    let search = TagSearch::parse("B::x").with_parent_classes(parents);
    let found: Vec<Tag> = engine
        .create_exact_results(&search)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].class_name, "A");
    assert_eq!(found[0].kind, TagKind::Member);
}

#[test]
fn stored_fields_survive_a_round_trip() {
    let source = r#"<?php
class Repo {
    /**
     * Load one record.
     * @return Record
     */
    public function load(int $id) {}
}
"#;
    let (_indexer, engine) = setup(&[("/src/repo.php", source)]);

    let found = exact(&engine, "Repo::load");
    assert_eq!(found.len(), 1);
    let tag = &found[0];
    assert_eq!(tag.kind, TagKind::Method);
    assert_eq!(tag.return_type, "Record");
    assert!(tag.signature.contains("function load(int $id)"), "{}", tag.signature);
    assert!(tag.comment.contains("Load one record."));
    assert_eq!(tag.line_number, 7);
}

#[test]
fn file_search_honours_line_numbers() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("short.php"), "<?php\nfunction a() {}\n").unwrap();
    fs::write(dir.path().join("long.php"), "<?php\n\n\n\n\nfunction b() {}\n").unwrap();

    let store = TagStore::open_in_memory().unwrap();
    let indexer = Indexer::new(store.clone(), Config::default());
    indexer.index_directory(dir.path(), &CancelFlag::new()).unwrap();
    let engine = TagSearchEngine::new(store);

    let names = |query: &str| -> Vec<String> {
        engine
            .create_near_match_file_results(&TagSearch::parse(query))
            .unwrap()
            .map(|f| f.unwrap().name)
            .collect()
    };

    let mut all = names("php");
    all.sort();
    assert_eq!(all, vec!["long.php", "short.php"]);
    assert_eq!(names("long.php:5"), vec!["long.php"]);
    assert!(names("short.php:5").is_empty());
    assert!(names("short.php:0").is_empty());
}

#[test]
fn natives_answer_alongside_user_code() {
    let (_indexer, engine) = setup(&[("/src/a.php", "<?php function strlen_custom() {}")]);
    let engine = engine.with_natives(NativeStore::load().unwrap());

    let found = near(&engine, "strlen");
    assert!(found.iter().any(|t| !t.is_native && t.identifier == "strlen_custom"));
    assert!(found.iter().any(|t| t.is_native && t.identifier == "strlen"));
    assert!(found.windows(2).all(|w| w[0].key() <= w[1].key()));
}

#[test]
fn namespace_near_match_leaves_out_sibling_namespaces() {
    let (_indexer, engine) = setup(&[
        ("/src/first.php", "<?php\nnamespace First;\nclass Inside {}\n"),
        ("/src/firstx.php", "<?php\nnamespace Firstx;\nclass Outside {}\n"),
        ("/src/ab.php", "<?php\nnamespace A\\B;\nclass Kept {}\n"),
        ("/src/ac.php", "<?php\nnamespace A\\C;\nclass Dropped {}\n"),
    ]);

    let listed = |query: &str| -> Vec<String> {
        near(&engine, query).iter().map(Tag::fully_qualified_name).collect()
    };

    let first = listed("\\First");
    assert!(first.contains(&"\\First\\Inside".to_string()), "{:?}", first);
    assert!(!first.iter().any(|name| name.starts_with("\\Firstx\\")), "{:?}", first);

    let ab = listed("\\A\\B");
    assert!(ab.contains(&"\\A\\B\\Kept".to_string()), "{:?}", ab);
    assert!(!ab.iter().any(|name| name.starts_with("\\A\\C")), "{:?}", ab);
}

#[test]
fn non_ascii_namespace_matches_in_any_case() {
    let (_indexer, engine) = setup(&[("/src/u.php", "<?php\nnamespace Über;\nclass Foo {}\n")]);

    assert_eq!(exact(&engine, "\\Über\\Foo").len(), 1);
    assert_eq!(exact(&engine, "\\über\\Foo").len(), 1);
    let found = near(&engine, "\\ÜBER\\f");
    assert!(found.iter().any(|t| t.identifier == "Foo"));
}

#[test]
fn reindex_between_pages_yields_no_duplicates() {
    let source = "<?php class Aa1 {} class Aa2 {} class Aa3 {}";
    let store = TagStore::open_in_memory().unwrap();
    let indexer = Indexer::new(store.clone(), Config::default());
    indexer.build_resource_cache_for_file("/src/a.php", source, true).unwrap();
    let engine = TagSearchEngine::new(store).with_page_size(1);

    let mut results = engine.create_near_match_results(&TagSearch::parse("Aa")).unwrap();
    assert!(results.advance().unwrap());
    let mut seen = vec![results.current().unwrap().identifier.clone()];

    // a writer lands between two pages
    indexer.build_resource_cache_for_file("/src/a.php", source, true).unwrap();

    while results.advance().unwrap() {
        seen.push(results.current().unwrap().identifier.clone());
    }
    assert_eq!(seen, vec!["Aa1", "Aa2", "Aa3"]);
}

#[test]
fn imported_trait_from_another_namespace_resolves() {
    let (_indexer, engine) = setup(&[
        ("/src/x.php", "<?php\nnamespace X;\ntrait T { function onlyInXT() {} }\n"),
        ("/src/y.php", "<?php\nnamespace Y;\nuse X\\T;\nclass D { use T; }\n"),
        ("/src/z.php", "<?php\nnamespace Z;\ntrait T { function onlyInZT() {} }\nclass D { use T; }\n"),
    ]);

    let found = exact(&engine, "\\Y\\D::onlyInXT");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].namespace_name, "\\X");
    assert!(exact(&engine, "\\Y\\D::onlyInZT").is_empty());
    assert!(exact(&engine, "\\Z\\D::onlyInXT").is_empty());
    assert_eq!(exact(&engine, "\\Z\\D::onlyInZT").len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn near_matches_are_in_key_order(
        classes in prop::collection::btree_set("[a-z]{1,6}", 1..8),
        prefix in "[a-z]",
    ) {
        let source: String = std::iter::once("<?php\n".to_string())
            .chain(classes.iter().map(|c| format!("class {}Zq {{ function run() {{}} }}\nfunction {}ZqFn() {{}}\n", c, c)))
            .collect();
        let (_indexer, engine) = setup(&[("/src/gen.php", &source)]);

        let keys: Vec<String> = near(&engine, &prefix).iter().map(Tag::key).collect();
        prop_assert!(keys.windows(2).all(|w| w[0] <= w[1]));

        let expected = classes
            .iter()
            .filter(|c| c.to_lowercase().starts_with(&prefix))
            .count();
        // each matching class contributes the class and its function
        prop_assert_eq!(keys.len(), expected * 2);
    }

    #[test]
    fn class_sorts_before_its_members(stem in "[a-z]{1,6}", members in prop::collection::btree_set("[a-z]{1,6}", 1..5)) {
        let class = format!("{}Zq", stem);
        let body: String = members.iter().map(|m| format!("function {}_m() {{}} ", m)).collect();
        let source = format!("<?php class {} {{ {} }}", class, body);
        let (_indexer, engine) = setup(&[("/src/gen.php", &source)]);

        let prefix = Tag::new(TagKind::Class, class.clone()).key();
        let in_range = engine.store().lookup_by_key_range(&prefix).unwrap();
        prop_assert_eq!(in_range.len(), members.len() + 1);
        prop_assert_eq!(in_range[0].kind, TagKind::Class);
    }
}
