mod cacher_lifecycle_test;
